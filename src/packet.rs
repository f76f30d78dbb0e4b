//! A bounded byte buffer for building download packets.

// ****************************************************************************
//
// Imports
//
// ****************************************************************************

use alloc::vec::Vec;

use crate::error::{Error, Result};

// ****************************************************************************
//
// Public Types
//
// ****************************************************************************

/// An append-only byte buffer that never grows past `max_size`.
///
/// Appends either land completely or not at all; a refused append leaves the
/// contents untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct ByteArray {
    data: Vec<u8>,
    max_size: usize,
}

// ****************************************************************************
//
// Public Impl/Functions/Modules
//
// ****************************************************************************

impl ByteArray {
    /// Create an empty buffer. The storage is allocated up front.
    pub fn new(max_size: usize) -> ByteArray {
        ByteArray {
            data: Vec::with_capacity(max_size),
            max_size,
        }
    }

    /// Forget the contents, keep the storage.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Append a slice of bytes.
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        if self.data.len() + bytes.len() > self.max_size {
            return Err(Error::BufferOverflow);
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Append a single byte.
    pub fn push(&mut self, byte: u8) -> Result<()> {
        if self.data.len() >= self.max_size {
            return Err(Error::BufferOverflow);
        }
        self.data.push(byte);
        Ok(())
    }

    /// Drop everything past `len`. Used to roll back a partial encode.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
