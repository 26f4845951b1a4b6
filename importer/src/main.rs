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

//! The worker-pod importer. Reads the env contract stamped by the
//! controller, streams the source through the format pipeline onto the
//! volume and reports the outcome through the termination message.

use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use env_logger::{Builder, Env, Target};
use log::{debug, error, info};

use common::utils::parse_quantity;
use common::values::{
    CONTENT_TYPE_ARCHIVE, IMPORTER_ACCESS_KEY_ID, IMPORTER_CERT_DIR, IMPORTER_CONTENT_TYPE,
    IMPORTER_DATA_DIR, IMPORTER_ENDPOINT, IMPORTER_IMAGE_SIZE, IMPORTER_PREALLOCATION,
    IMPORTER_SECRET_KEY, IMPORTER_SOURCE, IMPORTER_WRITE_BLOCK_PATH, IMPORT_PROGRESS_METRIC,
    OWNER_UID, PREALLOCATION_APPLIED_MESSAGE, SOURCE_HTTP, SOURCE_NONE, SOURCE_S3,
};

mod destination;
mod executor;
mod format;
mod progress;
mod source;
mod util;

use executor::RealCommandExecutor;
use util::{parse_env_var, write_termination_message, CountingReader};

const IMPORTER_VERSION: Option<&'static str> = option_env!("CARGO_PKG_VERSION");

fn main() {
    Builder::from_env(Env::default().default_filter_or("importer=info"))
        .target(Target::Stdout)
        .init();
    info!("importer version is {}", IMPORTER_VERSION.unwrap_or("Not Found"));
    if let Err(e) = run() {
        error!("import failed: {:#}", e);
        let _ = write_termination_message(&format!("{:#}", e));
        process::exit(1);
    }
}

struct ImportEnv {
    owner_uid: String,
    source: String,
    content_type: String,
    endpoint: String,
    access_key: String,
    secret_key: String,
    cert_dir: String,
    preallocation: bool,
    image_size: String,
}

fn read_env() -> Result<ImportEnv> {
    Ok(ImportEnv {
        owner_uid: parse_env_var(OWNER_UID, false)?,
        source: parse_env_var(IMPORTER_SOURCE, false)?,
        content_type: parse_env_var(IMPORTER_CONTENT_TYPE, false)?,
        endpoint: parse_env_var(IMPORTER_ENDPOINT, false)?,
        access_key: parse_env_var(IMPORTER_ACCESS_KEY_ID, false)?,
        secret_key: parse_env_var(IMPORTER_SECRET_KEY, false)?,
        cert_dir: parse_env_var(IMPORTER_CERT_DIR, false)?,
        preallocation: parse_env_var(IMPORTER_PREALLOCATION, false)? == "true",
        image_size: parse_env_var(IMPORTER_IMAGE_SIZE, false)?,
    })
}

fn dest_is_block() -> bool {
    Path::new(IMPORTER_WRITE_BLOCK_PATH).exists()
}

fn dest_path() -> PathBuf {
    if dest_is_block() {
        PathBuf::from(IMPORTER_WRITE_BLOCK_PATH)
    } else {
        Path::new(IMPORTER_DATA_DIR).join("disk.img")
    }
}

fn run() -> Result<()> {
    let env = read_env()?;
    let executor = RealCommandExecutor {};
    debug!("import source {:?}, content type {:?}", env.source, env.content_type);

    match env.source.as_str() {
        SOURCE_NONE => {
            if dest_is_block() {
                // a raw device needs no image file; it is used as-is
                info!("blank image requested on a block volume, nothing to create");
            } else {
                let size = parse_quantity(&env.image_size)
                    .with_context(|| format!("invalid image size {:?}", env.image_size))?;
                let dest = dest_path();
                destination::create_blank_image(
                    &executor,
                    dest.to_str().unwrap_or_default(),
                    size,
                    env.preallocation,
                )?;
            }
        }
        SOURCE_HTTP | SOURCE_S3 => import_from_endpoint(&env, &executor)?,
        other => bail!("source {:?} is not handled by this importer image", other),
    }

    info!("import complete");
    if env.preallocation {
        write_termination_message(PREALLOCATION_APPLIED_MESSAGE)?;
    }
    Ok(())
}

fn import_from_endpoint(env: &ImportEnv, executor: &RealCommandExecutor) -> Result<()> {
    let cert_dir =
        if env.cert_dir.is_empty() { None } else { Some(Path::new(env.cert_dir.as_str())) };
    let client = source::build_client(cert_dir)?;
    let src = source::open_endpoint(&client, &env.endpoint, &env.access_key, &env.secret_key)?;
    let total = src.content_length;
    check_destination_space(executor, total)?;

    let counting = CountingReader::new(src.response);
    start_progress_reporter(counting.counter(), total, env.owner_uid.clone());
    let mut readers = format::FormatReaders::new(counting)?;

    if env.content_type == CONTENT_TYPE_ARCHIVE {
        if dest_is_block() {
            bail!("archive content type cannot be written to a block volume");
        }
        return destination::unarchive_tar(readers, Path::new(IMPORTER_DATA_DIR));
    }

    let dest = dest_path();
    let dest_str = dest.to_str().unwrap_or_default();
    if readers.convert {
        // stream the image next to the destination first, qemu-img needs
        // the complete file to convert
        let scratch = scratch_path(&dest);
        let scratch_str = scratch.to_str().unwrap_or_default();
        destination::stream_data_to_file(&mut readers, scratch_str)?;
        destination::convert_to_raw(executor, scratch_str, dest_str, env.preallocation)?;
        let _ = std::fs::remove_file(&scratch);
    } else {
        let written = destination::stream_data_to_file(&mut readers, dest_str)?;
        if env.preallocation {
            let target = parse_quantity(&env.image_size).unwrap_or(written as i64);
            let mut out = std::fs::OpenOptions::new().write(true).open(&dest)?;
            destination::preallocate(&mut out, written as i64, target, dest_is_block())?;
        }
    }
    Ok(())
}

// refuse the import up front when the volume obviously cannot hold it
fn check_destination_space(executor: &RealCommandExecutor, content_length: u64) -> Result<()> {
    const BUFFER: i64 = 10 * 1024 * 1024;
    if content_length == 0 {
        return Ok(());
    }
    let available = if dest_is_block() {
        destination::get_available_space_block(executor, IMPORTER_WRITE_BLOCK_PATH)?
    } else {
        destination::get_available_space(Path::new(IMPORTER_DATA_DIR))?
    };
    if available >= 0 && (content_length as i64) + BUFFER > available {
        bail!(
            "not enough space on the volume: {} bytes available, {} needed",
            available,
            content_length
        );
    }
    Ok(())
}

fn scratch_path(dest: &Path) -> PathBuf {
    if dest_is_block() {
        Path::new(IMPORTER_DATA_DIR).join("scratch.img")
    } else {
        dest.with_extension("scratch")
    }
}

fn start_progress_reporter(counter: Arc<AtomicU64>, total: u64, owner_uid: String) {
    if total == 0 {
        return;
    }
    thread::spawn(move || loop {
        let percent = progress::percent_complete(&counter, total);
        info!("{}", progress::format_metric_line(IMPORT_PROGRESS_METRIC, &owner_uid, percent));
        if percent >= 100.0 {
            break;
        }
        thread::sleep(Duration::from_secs(5));
    });
}
