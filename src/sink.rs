//! Where a client transfer's reassembled chunks go.

use std::io::{self, Write};

use crate::protocol::RequestTag;

pub trait TransferSink {
    /// Called once per chunk, strictly in sequence order.
    fn deliver(&mut self, chunk: Vec<u8>) -> io::Result<()>;
}

/// Collects directory entry names from `LS` and `ENTRY` transfers.
///
/// An `LS_ENTRY` chunk is exactly one name, which may itself contain a
/// newline. Only `ENTRY` pages are newline separated.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Listing {
    names: Vec<String>,
    paged: bool,
}

impl Listing {
    /// The sink for `request`'s tag.
    pub fn for_tag(tag: RequestTag) -> Self {
        Self {
            names: Vec::new(),
            paged: tag == RequestTag::Entry,
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn into_names(self) -> Vec<String> {
        self.names
    }
}

impl TransferSink for Listing {
    // The closing TERM of an LS is empty.
    fn deliver(&mut self, chunk: Vec<u8>) -> io::Result<()> {
        let text = String::from_utf8_lossy(&chunk);
        if self.paged {
            self.names
                .extend(text.split('\n').filter(|name| !name.is_empty()).map(str::to_owned));
        } else if !text.is_empty() {
            self.names.push(text.into_owned());
        }
        Ok(())
    }
}

/// Streams file contents into any writer.
#[derive(Debug)]
pub struct WriteSink<W: Write> {
    writer: W,
    written: u64,
}

impl<W: Write> WriteSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> TransferSink for WriteSink<W> {
    fn deliver(&mut self, chunk: Vec<u8>) -> io::Result<()> {
        self.writer.write_all(&chunk)?;
        self.written += chunk.len() as u64;
        Ok(())
    }
}
