//! HTML rendering for the index page.

use crate::storage::UnreadView;

const PAGE_HEAD: &str = r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<title>tidings</title>
<script>
function markRead(id, link) {
  fetch('/markAsRead', {
    method: 'POST',
    headers: {'Content-Type': 'application/x-www-form-urlencoded'},
    body: new URLSearchParams({href: link})
  });
  document.getElementById(id).style.display = 'none';
}
function markAll(cls) {
  document.querySelectorAll('button.' + cls).forEach(function (b) { b.click(); });
}
</script>
</head>
<body>
<form method="post" action="/add">
Add new subscription: <input type="text" name="url" size="80" />
<input type="submit" value="Add" />
</form>
<br />
"#;

/// Render the unread view as a single HTML page.
pub fn index_page(view: &UnreadView) -> String {
    let mut html = String::from(PAGE_HEAD);
    let mut entry_id = 0usize;
    let mut source_index = 0usize;

    for (folder, sources) in view {
        html.push_str(&format!("<h2>{}</h2>\n", escape(folder)));
        for source in sources {
            let class = format!("source_{}", source_index);
            source_index += 1;
            let title = if source.title.is_empty() {
                &source.url
            } else {
                &source.title
            };
            html.push_str(&format!("<h3>{}</h3>\n", escape(title)));
            html.push_str(&format!(
                "<button onclick=\"markAll('{}'); return false\">Mark all as read</button>\n<ul>\n",
                class
            ));
            for entry in &source.entries {
                let title = if entry.title.is_empty() {
                    &entry.url
                } else {
                    &entry.title
                };
                html.push_str(&format!(
                    "<li id=\"entry_{id}\"><button class=\"{class}\" onclick=\"markRead('entry_{id}', '{link_js}'); return false\">Mark Read</button> <a href=\"{link}\">{title}</a></li>\n",
                    id = entry_id,
                    class = class,
                    link_js = escape(&js_string(&entry.url)),
                    link = escape(&entry.url),
                    title = escape(title),
                ));
                entry_id += 1;
            }
            html.push_str("</ul>\n");
        }
    }

    html.push_str("</body></html>");
    html
}

/// Escape text for HTML element content and double-quoted attributes.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Escape text for a single-quoted JavaScript string literal.
fn js_string(text: &str) -> String {
    text.replace('\\', "\\\\").replace('\'', "\\'")
}
