// SKSTACK/IP シリアルコマンドプロトコル
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
pub mod dongle;
pub mod response;

pub use dongle::*;
pub use response::*;
