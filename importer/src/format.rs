/*
 * Copyright (c) Huawei Technologies Co., Ltd. 2023. All rights reserved.
 * CDI is licensed under the Mulan PSL v2.
 * You can use this software according to the terms and conditions of the Mulan PSL v2.
 * You may obtain a copy of Mulan PSL v2 at:
 *     http://license.coscl.org.cn/MulanPSL2
 * THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND, EITHER EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR
 * PURPOSE.
 * See the Mulan PSL v2 for more details.
 */

//! Transparent unwrapping of the input stream. A fixed-size header is read
//! and matched against the registry of known formats; compressed formats
//! push a decompressing reader on the stack and the header is read again
//! from the new top, until a disk-image format (conversion required) or
//! unknown data (raw) is reached. Streams are never seekable, so the header
//! bytes are re-injected ahead of the remaining stream after every probe.

use std::collections::HashMap;
use std::io::{self, Cursor, Read};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use log::{debug, info};
use xz2::read::XzDecoder;

/// Largest offset+magic the registry needs to inspect.
pub const MAX_EXPECTED_HDR_SIZE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Gz,
    Xz,
    Qcow2,
    Vmdk,
    Vdi,
    Vhd,
    Vhdx,
}

#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub format: Format,
    magic: &'static [u8],
    offset: usize,
    size_off: usize,
    size_len: usize,
}

impl Header {
    fn matches(&self, buf: &[u8]) -> bool {
        let end = self.offset + self.magic.len();
        end <= buf.len() && &buf[self.offset..end] == self.magic
    }
}

/// One entry per known format; keys are removed once matched so a format
/// is unwrapped at most once per stream.
pub fn known_headers() -> HashMap<Format, Header> {
    let mut headers = HashMap::new();
    headers.insert(
        Format::Gz,
        Header { format: Format::Gz, magic: &[0x1f, 0x8b], offset: 0, size_off: 0, size_len: 0 },
    );
    headers.insert(
        Format::Xz,
        Header {
            format: Format::Xz,
            magic: &[0xfd, b'7', b'z', b'X', b'Z', 0x00],
            offset: 0,
            size_off: 0,
            size_len: 0,
        },
    );
    headers.insert(
        Format::Qcow2,
        Header {
            format: Format::Qcow2,
            magic: &[b'Q', b'F', b'I', 0xfb],
            offset: 0,
            size_off: 24,
            size_len: 8,
        },
    );
    headers.insert(
        Format::Vmdk,
        Header { format: Format::Vmdk, magic: b"KDMV", offset: 0, size_off: 0, size_len: 0 },
    );
    headers.insert(
        Format::Vdi,
        Header {
            format: Format::Vdi,
            magic: &[0x7f, 0x10, 0xda, 0xbe],
            offset: 0x40,
            size_off: 0,
            size_len: 0,
        },
    );
    headers.insert(
        Format::Vhd,
        Header { format: Format::Vhd, magic: b"conectix", offset: 0, size_off: 0, size_len: 0 },
    );
    headers.insert(
        Format::Vhdx,
        Header { format: Format::Vhdx, magic: b"vhdxfile", offset: 0, size_off: 0, size_len: 0 },
    );
    headers
}

/// The reader stack over the raw input stream. After construction,
/// [`FormatReaders`] reads as the innermost payload with all recognized
/// compression layers stripped; `convert` reports whether the payload is a
/// disk image that still needs out-of-band conversion to raw.
pub struct FormatReaders {
    top: Box<dyn Read + Send>,
    buf: [u8; MAX_EXPECTED_HDR_SIZE],
    pub convert: bool,
    pub archived: bool,
    pub archive_gz: bool,
    pub archive_xz: bool,
    /// Virtual size recorded in a qcow2 header, when one was seen.
    pub qcow2_size: Option<u64>,
}

impl std::fmt::Debug for FormatReaders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormatReaders").finish_non_exhaustive()
    }
}

impl FormatReaders {
    pub fn new(stream: impl Read + Send + 'static) -> Result<Self> {
        let mut readers = FormatReaders {
            top: Box::new(stream),
            buf: [0; MAX_EXPECTED_HDR_SIZE],
            convert: false,
            archived: false,
            archive_gz: false,
            archive_xz: false,
            qcow2_size: None,
        };
        readers.construct()?;
        Ok(readers)
    }

    fn construct(&mut self) -> Result<()> {
        let mut known = known_headers();
        debug!("checking compression and archive formats");
        loop {
            let header = self.match_header(&mut known).context("could not process image header")?;
            let header = match header {
                Some(header) => header,
                None => break,
            };
            info!("found header of type {:?}", header.format);
            match header.format {
                Format::Gz => {
                    let top = self.take_top();
                    self.top = Box::new(GzDecoder::new(top));
                    self.archived = true;
                    self.archive_gz = true;
                }
                Format::Xz => {
                    let top = self.take_top();
                    self.top = Box::new(XzDecoder::new(top));
                    self.archived = true;
                    self.archive_xz = true;
                }
                Format::Qcow2 => {
                    let mut size = [0u8; 8];
                    size.copy_from_slice(&self.buf[header.size_off..header.size_off + header.size_len]);
                    self.qcow2_size = Some(u64::from_be_bytes(size));
                    self.convert = true;
                    break;
                }
                Format::Vmdk | Format::Vdi | Format::Vhd | Format::Vhdx => {
                    self.convert = true;
                    break;
                }
            }
        }
        Ok(())
    }

    /// Read the header buffer from the top of the stack and push a
    /// multi-reader so that subsequent readers see the header bytes
    /// unchanged. Matched keys are removed from the registry.
    fn match_header(&mut self, known: &mut HashMap<Format, Header>) -> io::Result<Option<Header>> {
        let mut top = self.take_top();
        top.read_exact(&mut self.buf)?;
        self.top = Box::new(Cursor::new(self.buf.to_vec()).chain(top));

        let matched = known.values().find(|h| h.matches(&self.buf)).copied();
        if let Some(header) = matched {
            known.remove(&header.format);
            return Ok(Some(header));
        }
        Ok(None)
    }

    fn take_top(&mut self) -> Box<dyn Read + Send> {
        std::mem::replace(&mut self.top, Box::new(io::empty()))
    }
}

impl Read for FormatReaders {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.top.read(buf)
    }
}
