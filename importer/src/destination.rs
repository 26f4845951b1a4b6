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

//! Writing the unwrapped stream to its destination, a regular file on a
//! filesystem volume or a raw block device, plus the zero-fill strategies
//! used for preallocation and the conversion contract for disk images.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{anyhow, bail, Context, Result};
use log::info;
use nix::fcntl::FallocateFlags;

use crate::executor::CommandExecutor;

const ZERO_BUFFER_SIZE: usize = 32 << 20;

static ZERO_BUFFER: OnceLock<Vec<u8>> = OnceLock::new();

/// Size of the block device at the path, or -1 when the path is not a
/// block device.
pub fn get_available_space_block<T: CommandExecutor>(executor: &T, device: &str) -> Result<i64> {
    match fs::metadata(device) {
        Ok(meta) if meta.file_type().is_block_device() => {}
        Ok(_) => return Ok(-1),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(-1),
        Err(e) => return Err(e.into()),
    }
    let out = executor.run_command_with_output("blockdev", &["--getsize64", device])?;
    out.trim().parse::<i64>().map_err(|_| anyhow!("unexpected blockdev output {:?}", out))
}

/// Open the destination, whether it is a block device or a regular file.
/// A pre-existing regular file is refused, the volume is expected fresh.
pub fn open_file_or_block_device(file_name: &str) -> Result<File> {
    let is_block = fs::metadata(file_name)
        .map(|meta| meta.file_type().is_block_device())
        .unwrap_or(false);
    let file = if is_block {
        OpenOptions::new().write(true).open(file_name)
    } else {
        OpenOptions::new().write(true).create_new(true).open(file_name)
    };
    file.with_context(|| format!("could not open file {:?}", file_name))
}

/// Stream the reader to the destination; the partial file is removed when
/// the copy fails.
pub fn stream_data_to_file(reader: &mut impl Read, file_name: &str) -> Result<u64> {
    let mut out = open_file_or_block_device(file_name)?;
    info!("writing data to {}", file_name);
    let written = match io::copy(reader, &mut out) {
        Ok(written) => written,
        Err(e) => {
            let _ = fs::remove_file(file_name);
            return Err(anyhow!("unable to write to file: {}", e));
        }
    };
    out.sync_all()?;
    Ok(written)
}

/// Zero a range with fallocate, for block devices and preallocated files.
pub fn punch_hole(out_file: &mut File, start: i64, length: i64) -> Result<()> {
    info!("punching {}-byte hole at offset {}", length, start);
    nix::fcntl::fallocate(
        out_file.as_raw_fd(),
        FallocateFlags::FALLOC_FL_PUNCH_HOLE | FallocateFlags::FALLOC_FL_KEEP_SIZE,
        start,
        length,
    )?;
    out_file.seek(SeekFrom::Current(length))?;
    Ok(())
}

/// Resize the file to append zeroes, only valid for newly-created regular
/// files whose current end matches `start`.
pub fn append_zero_with_truncate(out_file: &mut File, start: i64, length: i64) -> Result<()> {
    info!("truncating {} bytes from offset {}", length, start);
    let end = out_file.seek(SeekFrom::End(0))? as i64;
    if start != end {
        bail!(
            "starting offset {} does not match previous ending offset {}, cannot safely append zeroes to this file using truncate",
            start,
            end
        );
    }
    out_file.set_len((start + length) as u64)?;
    out_file.seek(SeekFrom::End(0))?;
    Ok(())
}

/// Plain zero writes, the slow but reliable fallback.
pub fn append_zero_with_write(out_file: &mut File, start: i64, length: i64) -> Result<()> {
    info!("writing {} zero bytes at offset {}", length, start);
    let offset = out_file.seek(SeekFrom::Current(0))? as i64;
    if start != offset {
        bail!(
            "starting offset {} does not match previous ending offset {}, cannot safely append zeroes to this file using write",
            start,
            offset
        );
    }
    let zeroes = ZERO_BUFFER.get_or_init(|| vec![0u8; ZERO_BUFFER_SIZE]);
    let mut count: i64 = 0;
    while count < length {
        let block_size = std::cmp::min(zeroes.len() as i64, length - count);
        let written = out_file.write(&zeroes[..block_size as usize])?;
        count += written as i64;
    }
    Ok(())
}

/// Free space of the filesystem holding the path.
pub fn get_available_space(path: &Path) -> Result<i64> {
    let stat = nix::sys::statvfs::statvfs(path)?;
    Ok(stat.blocks_available() as i64 * stat.fragment_size() as i64)
}

/// Bring the destination up to the full requested size with zeroes. A
/// block device keeps its size, the tail range is punched; a fresh regular
/// file is truncated up, with plain zero writes as the fallback.
pub fn preallocate(out_file: &mut File, start: i64, target: i64, is_block: bool) -> Result<()> {
    if target <= start {
        return Ok(());
    }
    let length = target - start;
    if is_block {
        return punch_hole(out_file, start, length);
    }
    if append_zero_with_truncate(out_file, start, length).is_ok() {
        return Ok(());
    }
    out_file.seek(SeekFrom::End(0))?;
    append_zero_with_write(out_file, start, length)
}

/// Convert a written disk image to raw at the destination. The source was
/// fully streamed before conversion starts; qemu-img needs the whole file.
pub fn convert_to_raw<T: CommandExecutor>(
    executor: &T,
    src: &str,
    dst: &str,
    preallocate: bool,
) -> Result<()> {
    info!("converting {} to raw at {}", src, dst);
    if preallocate {
        executor.run_command(
            "qemu-img",
            &["convert", "-t", "none", "-p", "-O", "raw", "-o", "preallocation=falloc", src, dst],
        )
    } else {
        executor.run_command("qemu-img", &["convert", "-t", "none", "-p", "-O", "raw", src, dst])
    }
    .context("could not convert image to raw")
}

/// Create a blank raw image of the given byte size.
pub fn create_blank_image<T: CommandExecutor>(
    executor: &T,
    dst: &str,
    size: i64,
    preallocate: bool,
) -> Result<()> {
    info!("creating blank image {} of {} bytes", dst, size);
    let size_arg = size.to_string();
    if preallocate {
        executor.run_command(
            "qemu-img",
            &["create", "-f", "raw", "-o", "preallocation=falloc", dst, &size_arg],
        )
    } else {
        executor.run_command("qemu-img", &["create", "-f", "raw", dst, &size_arg])
    }
    .context("could not create blank image")
}

/// Unpack an archive stream onto the filesystem volume.
pub fn unarchive_tar(reader: impl Read, dest_dir: &Path) -> Result<()> {
    info!("untarring to {:?}", dest_dir);
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.unpack(dest_dir).context("could not unpack archive")
}
