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

use std::env;
use std::fs;
use std::io::{self, Read};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};

/// Fetch an environment variable of the importer contract, optionally
/// base64-decoding its value (credentials are injected encoded).
pub fn parse_env_var(name: &str, decode: bool) -> Result<String> {
    let value = env::var(name).unwrap_or_default();
    if !decode {
        return Ok(value);
    }
    let decoded =
        base64::decode(&value).map_err(|_| anyhow!("error decoding environment variable {:?}", name))?;
    String::from_utf8(decoded).map_err(|_| anyhow!("error decoding environment variable {:?}", name))
}

/// Reader wrapper that keeps a monotonic count of how much has been read;
/// the progress exporter samples the shared counter.
pub struct CountingReader<R> {
    reader: R,
    current: Arc<AtomicU64>,
    pub done: bool,
}

impl<R: Read> CountingReader<R> {
    pub fn new(reader: R) -> Self {
        CountingReader { reader, current: Arc::new(AtomicU64::new(0)), done: false }
    }

    pub fn counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.current)
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.reader.read(buf)?;
        self.current.fetch_add(n as u64, Ordering::Relaxed);
        self.done = n == 0;
        Ok(n)
    }
}

/// Write the given message to the pod termination file. Newlines are folded
/// to spaces and only the first line survives, the kubelet reads a single
/// line.
pub fn write_termination_message_to_file(file: &Path, message: &str) -> Result<()> {
    let folded = message.replace('\n', " ");
    let first_line = folded.lines().next().unwrap_or_default();
    fs::write(file, first_line)
        .map_err(|e| anyhow!("could not create termination message file: {}", e))
}

pub fn write_termination_message(message: &str) -> Result<()> {
    write_termination_message_to_file(
        Path::new(common::values::POD_TERMINATION_MESSAGE_FILE),
        message,
    )
}
