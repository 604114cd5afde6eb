// スマートメーターBルート計測値のPrometheusエクスポーター
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
pub mod collector;
pub mod config;
pub mod echonetlite;
pub mod exporter;
pub mod meter;
pub mod skstack;
pub mod telemetry;

pub use telemetry::*;
