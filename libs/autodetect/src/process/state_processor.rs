// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::sync::Arc;

use crate::error::Result;
use crate::persistence::ResultsPersister;

use super::PersistSource;

const READ_BUF_SIZE: usize = 64 * 1024;

/// Stores the model state the worker writes on its persist stream. State
/// documents are separated by a zero byte.
pub struct StateProcessor {
    job_id: String,
    persister: Arc<dyn ResultsPersister>,
}

impl StateProcessor {
    pub fn new(job_id: &str, persister: Arc<dyn ResultsPersister>) -> Self {
        Self {
            job_id: job_id.to_string(),
            persister,
        }
    }

    /// Drain `source` until it ends. Returns the number of documents
    /// stored. Opening a FIFO blocks until the worker opens it for writing.
    pub fn process(&self, source: PersistSource) -> Result<usize> {
        match source {
            PersistSource::Stream(stream) => self.process_stream(stream),
            PersistSource::Fifo(path) => {
                let file = File::open(&path)?;
                tracing::debug!("[{}] persist pipe {} opened", self.job_id, path.display());
                self.process_stream(file)
            }
        }
    }

    fn process_stream<R: Read>(&self, mut stream: R) -> Result<usize> {
        let mut pending = Vec::new();
        let mut chunk = vec![0u8; READ_BUF_SIZE];
        let mut stored = 0;
        loop {
            let n = match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };

            let mut start = 0;
            for (i, byte) in chunk[..n].iter().enumerate() {
                if *byte == 0 {
                    pending.extend_from_slice(&chunk[start..i]);
                    stored += self.persist(&pending)?;
                    pending.clear();
                    start = i + 1;
                }
            }
            pending.extend_from_slice(&chunk[start..n]);
        }
        stored += self.persist(&pending)?;
        tracing::debug!("[{}] persisted {} state documents", self.job_id, stored);
        Ok(stored)
    }

    fn persist(&self, document: &[u8]) -> Result<usize> {
        if document.iter().all(u8::is_ascii_whitespace) {
            return Ok(0);
        }
        self.persister.persist_state(&self.job_id, document)?;
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryResultsStore;

    #[test]
    fn test_documents_split_on_zero_byte() {
        let store = Arc::new(MemoryResultsStore::new());
        let processor = StateProcessor::new("j", store.clone());
        let bytes = b"{\"a\":1}\0\n\0{\"b\":2}\0{\"c\":3}".to_vec();

        let stored = processor
            .process(PersistSource::Stream(Box::new(std::io::Cursor::new(bytes))))
            .unwrap();

        assert_eq!(stored, 3);
        assert_eq!(
            store.state_documents("j"),
            vec!["{\"a\":1}", "{\"b\":2}", "{\"c\":3}"]
        );
    }

    #[test]
    fn test_empty_stream_stores_nothing() {
        let store = Arc::new(MemoryResultsStore::new());
        let processor = StateProcessor::new("j", store.clone());
        let stored = processor
            .process(PersistSource::Stream(Box::new(std::io::empty())))
            .unwrap();
        assert_eq!(stored, 0);
        assert!(store.operations().is_empty());
    }
}
