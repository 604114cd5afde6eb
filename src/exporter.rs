// Prometheusメトリクスとヘルスエンドポイント
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use crate::collector::SampleSink;
use crate::telemetry::TelemetrySample;
use anyhow::{Context, Result};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{Gauge, Opts, Registry, TextEncoder};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpListener;

/// 計測値ゲージ一式と準備状態
pub struct MetricsExporter {
    registry: Registry,
    cumulative_power_consumption: Gauge,
    power_consumption_per_unit_time: Gauge,
    instantaneous_power_consumption: Gauge,
    current: Gauge,
    power_factor: Gauge,
    ready: AtomicBool,
}

impl MetricsExporter {
    pub fn new() -> Result<Self, prometheus::Error> {
        let gauge = |name: &str, help: &str| -> Result<Gauge, prometheus::Error> {
            Gauge::with_opts(Opts::new(name, help).namespace("hems"))
        };
        let cumulative_power_consumption = gauge(
            "cumulative_power_consumption",
            "Cumulative Power Consumption [kWh]",
        )?;
        let power_consumption_per_unit_time = gauge(
            "latest_cumulative_power_consumption_per_unit_time",
            "Latest Cumulative Power Consumption per Unit time [kWh]",
        )?;
        let instantaneous_power_consumption = gauge(
            "instantaneous_power_consumption",
            "Instantaneous Power Consumption [W]",
        )?;
        let current = gauge("current", "Current [A]")?;
        let power_factor = gauge("power_factor", "Power Factor [%]")?;

        let registry = Registry::new();
        for g in [
            &cumulative_power_consumption,
            &power_consumption_per_unit_time,
            &instantaneous_power_consumption,
            &current,
            &power_factor,
        ] {
            registry.register(Box::new(g.clone()))?;
        }

        Ok(Self {
            registry,
            cumulative_power_consumption,
            power_consumption_per_unit_time,
            instantaneous_power_consumption,
            current,
            power_factor,
            ready: AtomicBool::new(false),
        })
    }

    /// 一度でもサンプルを出力できたか
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

impl SampleSink for MetricsExporter {
    fn on_sample(&self, sample: Option<&TelemetrySample>) {
        // サンプル欠落時はゲージを更新しない
        let Some(sample) = sample else { return };
        let as_f64 = |d: Decimal| d.to_f64().unwrap_or(0.0);
        self.cumulative_power_consumption
            .set(as_f64(sample.cumulative_kwh));
        self.power_consumption_per_unit_time
            .set(as_f64(sample.window_kwh));
        self.instantaneous_power_consumption
            .set(f64::from(sample.instant_watt));
        self.current.set(as_f64(sample.ampere));
        self.power_factor.set(as_f64(sample.power_factor));
        self.ready.store(true, Ordering::Relaxed);
    }
}

/// HTTPサーバーを起動する(/, /readiness, /metrics)
pub async fn serve_http(exporter: Arc<MetricsExporter>, addr: SocketAddr) -> Result<()> {
    let app = Router::new()
        .route("/", get(|| async { Json(json!("ok")) }))
        .route(
            "/readiness",
            get({
                let exporter = exporter.clone();
                move || readiness_handler(exporter.clone())
            }),
        )
        .route(
            "/metrics",
            get({
                let exporter = exporter.clone();
                move || metrics_handler(exporter.clone())
            }),
        );

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("{} をbindできない", addr))?;
    tracing::info!("HTTPサーバー開始 {}", addr);
    axum::serve(listener, app.into_make_service())
        .await
        .context("HTTPサーバーが異常終了した")?;
    Ok(())
}

// 一度でもサンプルを出力できていれば200、まだなら404
async fn readiness_handler(exporter: Arc<MetricsExporter>) -> impl IntoResponse {
    if exporter.is_ready() {
        (StatusCode::OK, Json(json!("ok")))
    } else {
        (StatusCode::NOT_FOUND, Json(json!("ng")))
    }
}

async fn metrics_handler(exporter: Arc<MetricsExporter>) -> impl IntoResponse {
    let families = exporter.registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("メトリクスのエンコードに失敗した: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                String::from("metrics encoding error"),
            )
                .into_response()
        }
    }
}

#[test]
fn test1() {
    use chrono::Utc;

    let exporter = MetricsExporter::new().unwrap();
    assert!(!exporter.is_ready());

    // サンプル欠落では準備完了にならず、ゲージも動かない
    exporter.on_sample(None);
    assert!(!exporter.is_ready());
    assert_eq!(exporter.cumulative_power_consumption.get(), 0.0);

    let sample = TelemetrySample::from_readings(Utc::now(), Decimal::new(1234, 1), 500, 20, 15);
    exporter.on_sample(Some(&sample));
    assert!(exporter.is_ready());
    assert_eq!(exporter.cumulative_power_consumption.get(), 123.4);
    assert_eq!(exporter.instantaneous_power_consumption.get(), 500.0);
    assert_eq!(exporter.current.get(), 3.5);
    assert_eq!(exporter.power_factor.get(), 142.9);
}

#[test]
fn test2() {
    use chrono::Utc;

    // /metrics に出る名前はhems名前空間
    let exporter = MetricsExporter::new().unwrap();
    let sample = TelemetrySample::from_readings(Utc::now(), Decimal::new(1234, 1), 500, 20, 15);
    exporter.on_sample(Some(&sample));

    let families = exporter.registry.gather();
    let names: Vec<&str> = families.iter().map(|f| f.get_name()).collect();
    assert!(names.contains(&"hems_cumulative_power_consumption"));
    assert!(names.contains(&"hems_latest_cumulative_power_consumption_per_unit_time"));
    assert!(names.contains(&"hems_instantaneous_power_consumption"));
    assert!(names.contains(&"hems_current"));
    assert!(names.contains(&"hems_power_factor"));
}
