// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::LazyLock;

/// User agent sent with every request, so that the server can tell client versions apart.
pub(super) static USER_AGENT: LazyLock<String> =
    LazyLock::new(|| new_user_agent(env!("CARGO_PKG_VERSION"), cfg!(debug_assertions)));

fn new_user_agent(pkg_version: &str, dev_build: bool) -> String {
    let version = match semver::Version::parse(pkg_version) {
        Ok(mut version) => {
            if dev_build && let Ok(pre) = semver::Prerelease::new("dev") {
                version.pre = pre;
            }
            version.to_string()
        }
        Err(_) => pkg_version.to_owned(),
    };
    format!("fieldsync/{version}")
}
