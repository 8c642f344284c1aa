use std::collections::VecDeque;

use crate::error::Result;

/// One page of a listing plus the token for the next one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<String>,
}

/// Fetches pages by continuation token. `None` asks for the first page.
pub trait PageSource<T>: Send {
    fn fetch(&mut self, token: Option<&str>) -> Result<Page<T>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Cursor {
    Start,
    Next(String),
    Done,
}

/// Restartable, finite lazy sequence over a paged source.
///
/// Pages are fetched only when [`Paged::next_page`] or the iterator asks
/// for them. [`Paged::has_more`] is false once the source has returned a
/// page without a continuation token.
pub struct Paged<T> {
    source: Box<dyn PageSource<T>>,
    cursor: Cursor,
    buffered: VecDeque<T>,
}

impl<T> Paged<T> {
    pub fn new(source: impl PageSource<T> + 'static) -> Self {
        Self {
            source: Box::new(source),
            cursor: Cursor::Start,
            buffered: VecDeque::new(),
        }
    }

    /// True while another page can be fetched.
    pub fn has_more(&self) -> bool {
        self.cursor != Cursor::Done
    }

    /// Fetch the next page; `None` once the sequence is exhausted.
    pub fn next_page(&mut self) -> Result<Option<Vec<T>>> {
        let token = match &self.cursor {
            Cursor::Done => return Ok(None),
            Cursor::Start => None,
            Cursor::Next(token) => Some(token.clone()),
        };
        let page = match self.source.fetch(token.as_deref()) {
            Ok(page) => page,
            Err(e) => {
                self.cursor = Cursor::Done;
                return Err(e);
            }
        };
        self.cursor = match page.next {
            Some(next) => Cursor::Next(next),
            None => Cursor::Done,
        };
        Ok(Some(page.items))
    }

    /// Start again from the first page.
    pub fn restart(&mut self) {
        self.cursor = Cursor::Start;
        self.buffered.clear();
    }
}

impl<T> Iterator for Paged<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.buffered.pop_front() {
                return Some(Ok(item));
            }
            match self.next_page() {
                Ok(Some(items)) => self.buffered.extend(items),
                Ok(None) => return None,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Pages over an in-memory vector; the token is the next offset.
pub struct VecSource<T> {
    items: Vec<T>,
    page_size: usize,
}

impl<T> VecSource<T> {
    pub fn new(items: Vec<T>, page_size: usize) -> Self {
        Self {
            items,
            page_size: page_size.max(1),
        }
    }
}

impl<T: Clone + Send> PageSource<T> for VecSource<T> {
    fn fetch(&mut self, token: Option<&str>) -> Result<Page<T>> {
        let start = token.and_then(|t| t.parse().ok()).unwrap_or(0usize);
        let end = (start + self.page_size).min(self.items.len());
        let items = self.items.get(start..end).unwrap_or_default().to_vec();
        let next = (end < self.items.len()).then(|| end.to_string());
        Ok(Page { items, next })
    }
}

impl<T: Clone + Send + 'static> Paged<T> {
    pub fn from_vec(items: Vec<T>, page_size: usize) -> Self {
        Self::new(VecSource::new(items, page_size))
    }
}
