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

use std::process::Command;

use anyhow::{anyhow, Result};
use log::trace;

/// Out-of-band tools (`qemu-img`, `blockdev`) are driven through this trait
/// so image handling can be tested without the binaries present.
pub trait CommandExecutor: Clone {
    fn run_command<'a>(&self, name: &'a str, args: &[&'a str]) -> Result<()>;
    fn run_command_with_output<'a>(&self, name: &'a str, args: &[&'a str]) -> Result<String>;
}

#[derive(Clone)]
pub struct RealCommandExecutor {}

impl CommandExecutor for RealCommandExecutor {
    fn run_command<'a>(&self, name: &'a str, args: &[&'a str]) -> Result<()> {
        let output = Command::new(name).args(args).output()?;
        if !output.status.success() {
            let error_message = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "Failed to run command: {} {:?}, stderr: {}",
                name,
                args,
                error_message
            ));
        }
        trace!("run_command: {} {:?} done", name, args);
        Ok(())
    }

    fn run_command_with_output<'a>(&self, name: &'a str, args: &[&'a str]) -> Result<String> {
        let output = Command::new(name).args(args).output()?;
        if !output.status.success() {
            let error_message = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "Failed to run command: {} {:?}, stderr: {}",
                name,
                args,
                error_message
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        trace!("run_command_with_output: {} {:?} done", name, args);
        Ok(stdout.trim_end_matches('\n').to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_command_with_output() {
        let executor = RealCommandExecutor {};
        let output = executor.run_command_with_output("echo", &["hello", "world"]).unwrap();
        assert_eq!(output, "hello world");
        assert!(executor.run_command_with_output("sh", &["-c", "exit 3"]).is_err());
    }

    #[test]
    fn test_run_command() {
        let executor = RealCommandExecutor {};
        assert!(executor.run_command("sh", &["-c", "true"]).is_ok());
        assert!(executor.run_command("sh", &["-c", "false"]).is_err());
    }
}
