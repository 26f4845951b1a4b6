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

//! HTTP(S)/S3-endpoint source. Credentials arrive through the env
//! contract, trust material is a directory of PEM files mounted from the
//! certConfigMap; proxy settings come from the standard proxy variables
//! which reqwest honors by itself.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::{debug, info};
use reqwest::blocking::{Client, Response};
use reqwest::Certificate;

pub struct HttpSource {
    pub response: Response,
    pub content_length: u64,
}

/// Build the blocking client, loading every PEM found in the cert
/// directory as an extra root.
pub fn build_client(cert_dir: Option<&Path>) -> Result<Client> {
    let mut builder = Client::builder().use_rustls_tls();
    if let Some(dir) = cert_dir {
        for entry in fs::read_dir(dir).with_context(|| format!("reading cert dir {:?}", dir))? {
            let path = entry?.path();
            if path.extension().map(|e| e == "pem" || e == "crt").unwrap_or(false) {
                debug!("loading CA certificate {:?}", path);
                let ca = Certificate::from_pem(&fs::read(&path)?)
                    .with_context(|| format!("parsing certificate {:?}", path))?;
                builder = builder.add_root_certificate(ca);
            }
        }
    }
    Ok(builder.build()?)
}

/// Open the endpoint for streaming. Basic-auth credentials double as S3
/// access/secret keys for S3-compatible endpoints.
pub fn open_endpoint(
    client: &Client,
    endpoint: &str,
    access_key: &str,
    secret_key: &str,
) -> Result<HttpSource> {
    info!("streaming from endpoint {}", endpoint);
    let mut request = client.get(endpoint);
    if !access_key.is_empty() {
        request = request.basic_auth(access_key, Some(secret_key));
    }
    let response =
        request.send().with_context(|| format!("Failed to fetch from URL: {}", endpoint))?;
    if response.status() != reqwest::StatusCode::OK {
        bail!("Failed to read from {}, status: {}", endpoint, response.status());
    }
    let content_length = response.content_length().unwrap_or_default();
    debug!("endpoint content length: {}", content_length);
    Ok(HttpSource { response, content_length })
}
