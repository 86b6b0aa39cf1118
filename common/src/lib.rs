// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Domain types shared by the offline client and the API transport.

pub mod identifiers;
pub mod mutations;
