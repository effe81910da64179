use crate::db;
use crate::library::{self, VideoRecord};
use crate::media::Category;
use crate::naming;
use crate::Result;
use std::fmt::Write as _;
use std::path::Path;
use tracing::{info, warn};

pub const INDEX_FILE: &str = "_index.html";
const UNCATEGORIZED: &str = "Uncategorized";
const NO_PROMPT: &str = "No prompt available.";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GalleryStats {
    pub videos: usize,
    pub pages: usize,
    pub skipped: usize,
}

pub fn page_file_name(page: usize) -> String {
    format!("_page-{page}.html")
}

pub fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}

/// Regenerates `_index.html` and every `_page-{n}.html` from the metadata store.
pub fn rebuild(download_dir: &Path, videos_per_page: usize) -> Result<GalleryStats> {
    if !db::exists(download_dir) {
        warn!(dir = %download_dir.display(), "metadata database not found; skipping gallery rebuild");
        return Ok(GalleryStats::default());
    }

    let records = library::list_records(download_dir)?;
    std::fs::create_dir_all(download_dir)?;
    let index_path = download_dir.join(INDEX_FILE);

    if records.is_empty() {
        let mut out = String::new();
        push_header(&mut out, "Video Index");
        out.push_str("<header><h1>No Videos Found</h1><p>Start the scraper to download videos.</p></header>");
        push_footer(&mut out);
        std::fs::write(&index_path, out)?;
        remove_stale_pages(download_dir, 0)?;
        info!("gallery is empty");
        return Ok(GalleryStats::default());
    }

    let per_page = videos_per_page.max(1);
    let total_pages = records.len().div_ceil(per_page);
    let mut stats = GalleryStats {
        videos: records.len(),
        pages: total_pages,
        skipped: 0,
    };

    for (idx, chunk) in records.chunks(per_page).enumerate() {
        let page = idx + 1;
        let mut out = String::new();
        push_header(&mut out, &format!("Page {page} - Scraped Videos"));
        out.push_str("<header><h1>Scraped Videos</h1><p>A collection of all downloaded videos.</p></header>");
        push_filter_controls(&mut out);
        out.push_str(&pagination_nav(page, total_pages));
        out.push_str("<div class='video-grid'>");
        for record in chunk {
            match locate(download_dir, &record.download_filename) {
                Some((rel, category)) => push_card(&mut out, record, &rel, category),
                None => {
                    warn!(file = %record.download_filename, "video file not found; leaving it out of the gallery");
                    stats.skipped += 1;
                }
            }
        }
        out.push_str("</div>");
        out.push_str(&pagination_nav(page, total_pages));
        push_footer(&mut out);
        std::fs::write(download_dir.join(page_file_name(page)), out)?;
    }
    remove_stale_pages(download_dir, total_pages)?;

    let mut index = String::new();
    push_header(&mut index, "Video Index");
    let _ = write!(
        index,
        "<header><h1>Video Page Index</h1><p>A total of {} videos across {} pages.</p></header>",
        records.len(),
        total_pages
    );
    index.push_str("<ul class='page-list'>");
    for page in 1..=total_pages {
        let _ = write!(
            index,
            "<li><a href='{}'>Page {page}</a></li>",
            page_file_name(page)
        );
    }
    index.push_str("</ul>");
    push_footer(&mut index);
    std::fs::write(&index_path, index)?;

    info!(
        videos = stats.videos,
        pages = stats.pages,
        skipped = stats.skipped,
        "gallery rebuilt"
    );
    Ok(stats)
}

/// Finds the file in a category folder or the download root.
fn locate(download_dir: &Path, filename: &str) -> Option<(String, &'static str)> {
    for category in Category::ALL {
        if download_dir.join(category.folder()).join(filename).is_file() {
            return Some((format!("{}/{filename}", category.folder()), category.folder()));
        }
    }
    if download_dir.join(filename).is_file() {
        return Some((filename.to_string(), UNCATEGORIZED));
    }
    None
}

pub fn pagination_nav(current: usize, total: usize) -> String {
    if total <= 1 {
        return String::new();
    }

    let mut nav = String::from("<div class='pagination'>");
    if current > 1 {
        let _ = write!(nav, "<a href='{}'>&larr; Previous</a>", page_file_name(current - 1));
    }

    if total <= 7 {
        for page in 1..=total {
            push_page_link(&mut nav, page, current);
        }
    } else {
        push_page_link(&mut nav, 1, current);
        if current > 4 {
            nav.push_str("<span class='ellipsis'>...</span>");
        }
        let start = current.saturating_sub(2).max(2);
        let end = (current + 2).min(total - 1);
        for page in start..=end {
            push_page_link(&mut nav, page, current);
        }
        if current + 3 < total {
            nav.push_str("<span class='ellipsis'>...</span>");
        }
        push_page_link(&mut nav, total, current);
    }

    if current < total {
        let _ = write!(nav, "<a href='{}'>Next &rarr;</a>", page_file_name(current + 1));
    }
    nav.push_str("</div>");
    nav
}

fn push_page_link(out: &mut String, page: usize, current: usize) {
    let class = if page == current { "current-page" } else { "" };
    let _ = write!(out, "<a href='{}' class='{class}'>{page}</a>", page_file_name(page));
}

fn push_card(out: &mut String, record: &VideoRecord, rel_path: &str, category: &str) {
    let title = naming::display_title(&record.download_filename);
    let prompt = if record.prompt.is_empty() {
        NO_PROMPT
    } else {
        record.prompt.as_str()
    };
    let link = if record.discord_message_url.is_empty() {
        "#"
    } else {
        record.discord_message_url.as_str()
    };
    let src = escape_html(rel_path);
    let _ = write!(
        out,
        "<div class='video-entry' data-category='{category}'>\
<video controls preload='metadata' src='{src}'></video>\
<div class='video-info'><h3>{}</h3><div class='prompt-content'>{}</div>\
<div class='links'><a href='{src}' download>Download</a>\
<a href='{}' target='_blank'>Discord</a></div></div></div>",
        escape_html(&title),
        escape_html(prompt),
        escape_html(link),
    );
}

fn push_filter_controls(out: &mut String) {
    out.push_str("<div class='filter-controls'>");
    out.push_str("<button class='filter-btn' data-filter='all' onclick=\"filterVideos('all')\">All</button>");
    for (category, label) in [
        (Category::WithAudio, "With Audio"),
        (Category::WithoutAudio, "Without Audio"),
        (Category::InvalidOrCorrupt, "Corrupt"),
    ] {
        let folder = category.folder();
        let _ = write!(
            out,
            "<button class='filter-btn' data-filter='{folder}' onclick=\"filterVideos('{folder}')\">{label}</button>"
        );
    }
    out.push_str("</div>");
}

fn push_header(out: &mut String, title: &str) {
    let _ = write!(
        out,
        "<!DOCTYPE html>\n<html lang='en'>\n<head>\n<meta charset='UTF-8'>\n\
<meta name='viewport' content='width=device-width, initial-scale=1.0'>\n\
<title>{}</title>\n<style>{STYLE}</style>\n</head>\n<body>\n<div class='container'>\n",
        escape_html(title)
    );
}

fn push_footer(out: &mut String) {
    out.push_str("\n</div>\n<script>");
    out.push_str(FILTER_SCRIPT);
    out.push_str("</script>\n</body>\n</html>\n");
}

fn remove_stale_pages(download_dir: &Path, keep: usize) -> Result<()> {
    for entry in std::fs::read_dir(download_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(num) = name
            .strip_prefix("_page-")
            .and_then(|rest| rest.strip_suffix(".html"))
            .and_then(|n| n.parse::<usize>().ok())
        else {
            continue;
        };
        if num > keep {
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

const STYLE: &str = "body{font-family:system-ui,sans-serif;background:#111;color:#eee;margin:0}\
.container{max-width:1400px;margin:0 auto;padding:1rem}\
.video-grid{display:grid;grid-template-columns:repeat(auto-fill,minmax(320px,1fr));gap:1rem}\
.video-entry{background:#1c1c1c;border-radius:8px;overflow:hidden}\
.video-entry.hidden{display:none}\
.video-entry video{width:100%;background:#000}\
.video-info{padding:.75rem}\
.prompt-content{white-space:pre-wrap;font-size:.9rem;color:#bbb}\
.links a,.pagination a{color:#8ab4f8;margin-right:.75rem}\
.pagination{margin:1rem 0}\
.pagination .current-page{font-weight:bold;text-decoration:none;color:#fff}\
.filter-btn.active{background:#8ab4f8;color:#111}";

const FILTER_SCRIPT: &str = "function filterVideos(category){\
document.querySelectorAll('.filter-btn').forEach(function(b){\
b.classList.toggle('active',b.getAttribute('data-filter')===category);});\
document.querySelectorAll('.video-entry').forEach(function(v){\
v.classList.toggle('hidden',!(category==='all'||v.getAttribute('data-category')===category));});}\
document.addEventListener('DOMContentLoaded',function(){filterVideos('all');});";
