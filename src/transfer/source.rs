//! # Chunk sources
//!
//! [`ChunkSource`] abstracts "a file, readable in slices" so the
//! [`super::chunker::FileChunker`] state machine can be driven by plain
//! in-memory bytes under `cargo test` and by a real `web_sys::File` in
//! the browser, without the chunker itself ever depending on `web-sys`.
//! The split mirrors how the library this engine is grounded on keeps its
//! chunking logic (`storage::chunking`) independent of any particular
//! filesystem, reading through a generic byte slice instead.

use async_trait::async_trait;

use crate::error::{Error, Result};

/// A file-like byte source the chunker can read in sequential slices.
#[async_trait(?Send)]
pub trait ChunkSource {
    /// Total size of the source, in bytes. Fixed for the source's
    /// lifetime — browsers do not let the underlying `File` change size
    /// mid-read.
    fn size(&self) -> u64;

    /// The source's declared name, sent in the transfer header.
    fn name(&self) -> &str;

    /// The source's declared MIME type, sent in the transfer header.
    /// Empty string if unknown.
    fn mime(&self) -> &str;

    /// Read up to `len` bytes starting at `offset`. Returns fewer than
    /// `len` bytes only at end-of-source.
    async fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>>;
}

/// An in-memory [`ChunkSource`], used by tests and by any native embedder
/// that already has the bytes resident.
pub struct MemorySource {
    name: String,
    mime: String,
    bytes: Vec<u8>,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, mime: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self { name: name.into(), mime: mime.into(), bytes }
    }
}

#[async_trait(?Send)]
impl ChunkSource for MemorySource {
    fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn mime(&self) -> &str {
        &self.mime
    }

    async fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let offset = offset as usize;
        if offset >= self.bytes.len() {
            return Ok(Vec::new());
        }
        let end = (offset + len).min(self.bytes.len());
        Ok(self.bytes[offset..end].to_vec())
    }
}

#[async_trait(?Send)]
impl ChunkSource for Box<dyn ChunkSource> {
    fn size(&self) -> u64 {
        (**self).size()
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn mime(&self) -> &str {
        (**self).mime()
    }

    async fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        (**self).read_at(offset, len).await
    }
}

/// A [`ChunkSource`] backed by a browser `File`, read incrementally
/// through a `FileReader` so the whole file is never resident twice.
#[cfg(target_arch = "wasm32")]
pub mod js_source {
    use super::*;
    use js_sys::Uint8Array;
    use send_wrapper::SendWrapper;
    use wasm_bindgen::closure::Closure;
    use wasm_bindgen::{JsCast, JsValue};
    use web_sys::{File, FileReader, ProgressEvent};

    /// Wraps a `web_sys::File`. Each `read_at` call spins up its own
    /// `FileReader` and slices the `File` via `File::slice_with_i32_and_f64`
    /// rather than reusing one reader across calls, since `FileReader` has
    /// no notion of a current offset.
    pub struct JsFileSource {
        file: SendWrapper<File>,
        name: String,
        mime: String,
        size: u64,
    }

    impl JsFileSource {
        pub fn new(file: File) -> Self {
            let name = file.name();
            let mime = file.type_();
            let size = file.size() as u64;
            Self { file: SendWrapper::new(file), name, mime, size }
        }
    }

    #[async_trait(?Send)]
    impl ChunkSource for JsFileSource {
        fn size(&self) -> u64 {
            self.size
        }

        fn name(&self) -> &str {
            &self.name
        }

        fn mime(&self) -> &str {
            &self.mime
        }

        async fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
            let end = ((offset as f64) + (len as f64)).min(self.size as f64);
            let blob = self
                .file
                .slice_with_f64_and_f64(offset as f64, end)
                .map_err(|e| Error::ChunkReadFailed(format!("{e:?}")))?;

            let (tx, rx) = futures::channel::oneshot::channel::<std::result::Result<Vec<u8>, String>>();
            let tx = std::rc::Rc::new(std::cell::RefCell::new(Some(tx)));

            let reader = FileReader::new().map_err(|e| Error::ChunkReadFailed(format!("{e:?}")))?;
            let reader = SendWrapper::new(reader);

            let onload_tx = tx.clone();
            let onload_reader = reader.clone();
            let onload = Closure::<dyn FnMut(ProgressEvent)>::new(move |_evt: ProgressEvent| {
                let result = onload_reader.result();
                if let Ok(sender) = result {
                    let array = Uint8Array::new(&sender);
                    let mut out = vec![0u8; array.length() as usize];
                    array.copy_to(&mut out);
                    if let Some(tx) = onload_tx.borrow_mut().take() {
                        let _ = tx.send(Ok(out));
                    }
                }
            });

            let onerror_tx = tx.clone();
            let onerror = Closure::<dyn FnMut(ProgressEvent)>::new(move |_evt: ProgressEvent| {
                if let Some(tx) = onerror_tx.borrow_mut().take() {
                    let _ = tx.send(Err("file read failed".to_string()));
                }
            });

            reader.set_onload(Some(onload.as_ref().unchecked_ref()));
            reader.set_onerror(Some(onerror.as_ref().unchecked_ref()));
            reader
                .read_as_array_buffer(&blob)
                .map_err(|e| Error::ChunkReadFailed(format!("{e:?}")))?;

            let outcome = rx.await.map_err(|_| Error::ChunkReadFailed("reader dropped".into()))?;

            // Keep the closures alive until the read settles.
            drop(onload);
            drop(onerror);

            outcome.map_err(Error::ChunkReadFailed)
        }
    }

    // Silence an unused-import warning when this module is compiled
    // without exercising the JsValue alias directly.
    #[allow(unused)]
    fn _assert_jsvalue(_: &JsValue) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_source_reads_exact_slices() {
        let src = MemorySource::new("a.bin", "application/octet-stream", vec![1, 2, 3, 4, 5]);
        assert_eq!(src.size(), 5);
        let chunk = src.read_at(1, 3).await.unwrap();
        assert_eq!(chunk, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn memory_source_truncates_at_end() {
        let src = MemorySource::new("a.bin", "", vec![1, 2, 3]);
        let chunk = src.read_at(2, 10).await.unwrap();
        assert_eq!(chunk, vec![3]);
    }

    #[tokio::test]
    async fn memory_source_past_end_is_empty() {
        let src = MemorySource::new("a.bin", "", vec![1, 2, 3]);
        let chunk = src.read_at(10, 5).await.unwrap();
        assert!(chunk.is_empty());
    }
}
