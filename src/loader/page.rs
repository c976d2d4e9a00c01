use crate::{pe::PAGE_SIZE, Error, Result};

/// One 4 KB page of the mapped image.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Page {
    /// Page with file content. Always exactly [`PAGE_SIZE`] bytes.
    Data(Box<[u8]>),
    /// Committed page filled with zeros
    Zero,
    /// Reserved but never committed. Reads as zeros, writes are dropped.
    #[default]
    Inaccessible,
}

impl Page {
    /// Build a data page from at most one page of bytes; the rest is zero filled.
    ///
    /// # Errors
    /// Returns [`crate::Error::NotEnoughSpace`] if the page cannot be allocated.
    pub fn from_bytes(bytes: &[u8]) -> Result<Page> {
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(PAGE_SIZE as usize)
            .map_err(|_| Error::NotEnoughSpace)?;
        buffer.resize(PAGE_SIZE as usize, 0);

        let len = bytes.len().min(PAGE_SIZE as usize);
        buffer[..len].copy_from_slice(&bytes[..len]);
        Ok(Page::Data(buffer.into_boxed_slice()))
    }

    /// Page contents, `None` for zero and inaccessible pages
    #[must_use]
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Page::Data(data) => Some(data),
            Page::Zero | Page::Inaccessible => None,
        }
    }

    /// Committed pages, data or zero
    #[must_use]
    pub fn is_accessible(&self) -> bool {
        !matches!(self, Page::Inaccessible)
    }

    /// Copy page bytes starting at `offset` into `out`, zeros for pages without data.
    pub(crate) fn read(&self, offset: usize, out: &mut [u8]) {
        match self {
            Page::Data(data) => out.copy_from_slice(&data[offset..offset + out.len()]),
            Page::Zero | Page::Inaccessible => out.fill(0),
        }
    }

    /// Write `bytes` at `offset`. A zero page becomes a data page first.
    ///
    /// Returns `false` when the page is inaccessible and the write was dropped.
    pub(crate) fn write(&mut self, offset: usize, bytes: &[u8]) -> bool {
        if matches!(self, Page::Zero) {
            *self = Page::Data(vec![0u8; PAGE_SIZE as usize].into_boxed_slice());
        }

        match self {
            Page::Data(data) => {
                data[offset..offset + bytes.len()].copy_from_slice(bytes);
                true
            }
            Page::Zero | Page::Inaccessible => false,
        }
    }
}
