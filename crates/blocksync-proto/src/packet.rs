use crate::header::{FrameKind, Header};

#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    pub header: Header,
    pub payload: &'a [u8],
}

impl<'a> FrameView<'a> {
    pub fn new(header: Header, payload: &'a [u8]) -> Self {
        Self { header, payload }
    }

    pub fn kind(&self) -> FrameKind {
        self.header.kind
    }
}
