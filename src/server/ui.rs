//! Server-rendered file manager page.

use super::SharedState;
use crate::{
    error::Error,
    listing::{self, Entry, EntryKind},
};
use axum::{
    extract::{Path as AxumPath, State},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Local};
use humansize::{format_size, BINARY};
use maud::{html, Markup, PreEscaped, DOCTYPE};

const STYLE: &str = r#"
body { background:#f8fafc; font-family:system-ui,sans-serif; margin:0; padding:2rem; color:#1f2937; }
.card { max-width:1100px; margin:0 auto; background:#fff; border-radius:.75rem; box-shadow:0 4px 12px rgba(0,0,0,.08); overflow:hidden; }
header { background:#1f2937; color:#fff; padding:1.5rem; }
header h1 { margin:0; font-size:1.6rem; }
header p { margin:.25rem 0 0; opacity:.75; font-size:.9rem; }
.toolbar { display:flex; align-items:center; justify-content:space-between; padding:1rem 1.5rem; }
ul { list-style:none; margin:0; padding:0 1.5rem 1.5rem; }
li { display:flex; align-items:center; gap:.75rem; border:1px solid #e5e7eb; border-radius:.5rem; padding:.5rem; margin-bottom:.5rem; }
li:hover { background:#f1f5f9; }
li a.name { flex-grow:1; color:inherit; text-decoration:none; }
.thumb { width:80px; height:60px; object-fit:cover; border-radius:.4rem; background:#e5e7eb; }
.meta { font-size:.75rem; color:#9ca3af; white-space:nowrap; }
button { background:#1f2937; color:#fff; border:0; border-radius:.5rem; padding:.5rem 1rem; font-weight:600; cursor:pointer; }
button:disabled { opacity:.5; cursor:not-allowed; }
.error { padding:10px; border:1px solid #dc2626; color:#dc2626; margin:10px; border-radius:.5rem; }
"#;

const SCRIPT: &str = r#"
const selectAll = document.getElementById('select-all');
const button = document.getElementById('download-selected');
const boxes = () => Array.from(document.querySelectorAll('.select-entry'));

function refresh() {
  const count = boxes().filter(cb => cb.checked).length;
  button.textContent = `Download selected (${count})`;
  button.disabled = count === 0;
}

selectAll.addEventListener('change', () => {
  boxes().forEach(cb => cb.checked = selectAll.checked);
  refresh();
});
boxes().forEach(cb => cb.addEventListener('change', refresh));

button.addEventListener('click', () => {
  const paths = boxes().filter(cb => cb.checked).map(cb => cb.dataset.path);
  if (paths.length === 0) return;
  // A plain form post lets the browser stream the archive to disk.
  const form = document.getElementById('download-form');
  form.elements.paths.value = JSON.stringify(paths);
  form.submit();
});

refresh();
"#;

/// Encodes each segment of a root-relative path for use in a URL.
fn href_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn error_page(error: Error) -> Response {
    let status = error.status();
    let message = error.to_string();
    let markup = html! {
        (DOCTYPE)
        html lang="en" {
            head { meta charset="UTF-8"; title { "Error" } style { (PreEscaped(STYLE)) } }
            body {
                div class="error" {
                    h2 { "Error" }
                    p { (message) }
                    a href="/" { "Back to the top" }
                }
            }
        }
    };
    (status, markup).into_response()
}

pub async fn index_handler(State(state): State<SharedState>) -> Result<Markup, Response> {
    render_directory(&state, "").await
}

pub async fn directory_handler(
    State(state): State<SharedState>,
    AxumPath(path): AxumPath<String>,
) -> Result<Markup, Response> {
    render_directory(&state, &path).await
}

async fn render_directory(state: &SharedState, path: &str) -> Result<Markup, Response> {
    let entries = listing::list(&state.root, path, state.list_options())
        .await
        .map_err(error_page)?;
    let current = path.trim_matches('/');
    let display_path = if current.is_empty() {
        state.root.display_name()
    } else {
        format!("{}/{}", state.root.display_name(), current)
    };
    let parent = current.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("");

    Ok(html! {
        (DOCTYPE)
        html lang="en" {
            head {
                meta charset="UTF-8";
                meta name="viewport" content="width=device-width, initial-scale=1.0";
                title { "File Manager · " (display_path) }
                style { (PreEscaped(STYLE)) }
            }
            body {
                div class="card" {
                    header {
                        h1 { "File Manager" }
                        p { "Serving: /" (display_path) }
                    }
                    div class="toolbar" {
                        label { input type="checkbox" id="select-all"; " Select all" }
                        button id="download-selected" disabled { "Download selected (0)" }
                    }
                    ul {
                        @if !current.is_empty() {
                            li {
                                a class="name" href=(if parent.is_empty() { "/".to_string() } else { format!("/files/{}", href_path(parent)) }) {
                                    "⬆️ .."
                                }
                            }
                        }
                        @for entry in &entries {
                            (entry_row(entry, state.thumbnail_size.min(160)))
                        }
                        @if entries.is_empty() {
                            li { span class="meta" { "This folder is empty." } }
                        }
                    }
                }
                form id="download-form" method="post" action="/download" hidden {
                    input type="hidden" name="paths";
                }
                script { (PreEscaped(SCRIPT)) }
            }
        }
    })
}

fn entry_row(entry: &Entry, thumb_size: u32) -> Markup {
    let encoded = href_path(&entry.path);
    let is_dir = entry.kind == EntryKind::Directory;
    let link = if is_dir {
        format!("/files/{}", encoded)
    } else {
        format!("/raw/{}", encoded)
    };
    let modified = entry.modified_at.map(|m| {
        let local: DateTime<Local> = m.into();
        local.format("%Y-%m-%d %H:%M").to_string()
    });
    let icon = match entry.kind {
        EntryKind::Directory => "📁",
        EntryKind::Image => "🖼️",
        EntryKind::Video => "🎬",
        EntryKind::Document => "📄",
        EntryKind::Other => "📦",
    };

    html! {
        li {
            input type="checkbox" class="select-entry" data-path=(entry.path);
            @if entry.has_preview {
                img class="thumb" loading="lazy" alt="" src=(format!("/preview/{}?size={}", encoded, thumb_size));
            }
            a class="name" href=(link) {
                (icon) " "
                @if is_dir { strong { (entry.name) "/" } } @else { (entry.name) }
            }
            span class="meta" {
                @if is_dir { "Folder" } @else { (format_size(entry.size, BINARY)) }
                @if let Some(modified) = &modified { " · " (modified) }
            }
            @if !is_dir {
                a class="meta" href=(format!("{}?download=1", link)) title="Download" { "⬇️" }
            }
        }
    }
}
