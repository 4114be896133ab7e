use crate::pages::Page;

use std::ops::Deref;
use std::sync::Arc;

/// A non-owning handle to a resident page.
///
/// Handles are returned pinned by `new_page` and `fetch`; the pin is the
/// lifetime token that keeps the page resident while the client works on
/// it. The handle does not unpin on drop: `unpin` is an explicit cache
/// operation because it carries the dirty flag.
pub struct PageHandle {
    page: Arc<Page>,
}

impl PageHandle {
    pub(crate) fn new(page: Arc<Page>) -> Self {
        Self { page }
    }
}

impl Deref for PageHandle {
    type Target = Page;

    fn deref(&self) -> &Self::Target {
        &self.page
    }
}
