use tracing::{debug, warn};

use crate::{
    engine::{IndexQuery, SearchHit, SearchLookup},
    error::Result,
    model::{ChangeEvent, EventType, folder_prefix},
};

/// Every indexed path under `prefix`, scrolling until an empty page.
pub fn indexed_paths(
    lookup: &dyn SearchLookup,
    index: &str,
    prefix: &str,
    page_size: usize,
) -> Result<Vec<String>> {
    let mut page = lookup.search(&IndexQuery::prefix(index, prefix, page_size))?;
    let mut open = page.scroll;
    let mut paths = Vec::new();

    let result = loop {
        if page.hits.is_empty() {
            break Ok(());
        }
        paths.extend(page.hits.iter().filter_map(SearchHit::path).map(str::to_string));
        let Some(scroll) = page.scroll else {
            break Ok(());
        };
        open = Some(scroll);
        page = match lookup.scroll_next(scroll) {
            Ok(next) => next,
            Err(e) => break Err(e),
        };
    };
    if let Some(scroll) = open {
        lookup.clear_scroll(scroll);
    }
    result.map(|()| paths)
}

/// Replace folder-scoped events with per-file events.
///
/// A DELETED folder wildcard becomes one DELETED per indexed file under it.
/// A FOLDER_MOVED becomes `MOVED_FROM(old, t)` and `MOVED_TO(new, t + 1)`
/// per indexed file. Other events pass through.
pub fn expand_events(
    lookup: &dyn SearchLookup,
    index: &str,
    events: Vec<ChangeEvent>,
    page_size: usize,
) -> Result<Vec<ChangeEvent>> {
    let mut expanded = Vec::with_capacity(events.len());
    for event in events {
        match event.event_type {
            EventType::Deleted => match event.folder_prefix() {
                Some(prefix) => {
                    let paths = indexed_paths(lookup, index, prefix, page_size)?;
                    debug!(
                        folder = %event.path,
                        files = paths.len(),
                        "expanded folder delete"
                    );
                    expanded.extend(paths.into_iter().map(|path| {
                        ChangeEvent::new(
                            event.timestamp,
                            EventType::Deleted,
                            &event.resource_id,
                            &path,
                        )
                    }));
                }
                None => expanded.push(event),
            },
            EventType::FolderMoved => {
                let Some(to) = event.path_to.as_deref() else {
                    warn!(folder = %event.path, "folder move without destination");
                    continue;
                };
                let from_prefix = as_folder(&event.path);
                let to_prefix = as_folder(to);
                let paths = indexed_paths(lookup, index, &from_prefix, page_size)?;
                debug!(
                    from = %from_prefix,
                    to = %to_prefix,
                    files = paths.len(),
                    "expanded folder move"
                );
                for old in paths {
                    let Some(rest) = old.strip_prefix(&from_prefix) else {
                        continue;
                    };
                    let new = format!("{to_prefix}{rest}");
                    expanded.push(ChangeEvent::new(
                        event.timestamp,
                        EventType::MovedFrom,
                        &event.resource_id,
                        &old,
                    ));
                    expanded.push(ChangeEvent::new(
                        event.timestamp + 1,
                        EventType::MovedTo,
                        &event.resource_id,
                        &new,
                    ));
                }
            }
            _ => expanded.push(event),
        }
    }
    Ok(expanded)
}

/// Folder prefix of `path`, accepting `/a/*`, `/a/` and `/a`.
fn as_folder(path: &str) -> String {
    match folder_prefix(path) {
        Some(prefix) => prefix.to_string(),
        None if path.ends_with('/') => path.to_string(),
        None => format!("{path}/"),
    }
}
