// ECHONET Lite 電文
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
pub mod frame;
pub mod smart_meter;

pub use frame::*;
