// Copyright Istio Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::process::Command;

// This build script stamps the binary with the build information reported by `kubecsr version`.
fn main() -> Result<(), anyhow::Error> {
    let revision = git(&["rev-parse", "HEAD"]).unwrap_or_else(|| "unknown".to_string());
    let status = match git(&["status", "--porcelain"]) {
        Some(s) if s.is_empty() => "Clean",
        Some(_) => "Modified",
        None => "unknown",
    };
    let tag = git(&["describe", "--tags", "--always"]).unwrap_or_else(|| "unknown".to_string());

    let info = [
        ("buildVersion", env!("CARGO_PKG_VERSION").to_string()),
        ("buildGitRevision", revision),
        ("buildStatus", status.to_string()),
        ("buildTag", tag),
        ("RUSTC_VERSION", rustc_version::version()?.to_string()),
    ];
    for (key, value) in info {
        println!("cargo:rustc-env=KUBECSR_BUILD_{key}={value}");
    }
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=.git/HEAD");
    Ok(())
}

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8(output.stdout).ok()?.trim().to_string())
}
