// スマートメーターから計測値を収集してPrometheus形式で公開する。
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use clap::Parser;
use hemsmetrics::collector::{CollectError, Collector};
use hemsmetrics::config::AppConfig;
use hemsmetrics::exporter::{self, MetricsExporter};
use hemsmetrics::meter::{
    AttachError, BrouteCredentials, RouteBId, RouteBPassword, SerialMeterSession,
};
use hemsmetrics::skstack::MINIMUM_SCAN_DURATION;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{Event, Subscriber};
use tracing_subscriber::{
    fmt::{self, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
};

/// 収集サイクル失敗後の再始動までのクールダウン時間
const RESTART_COOLDOWN: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
enum DaemonError {
    #[error(transparent)]
    Attach(#[from] AttachError),
    #[error(transparent)]
    Collect(#[from] CollectError),
    #[error(r#"接続タスク "{0}""#)]
    TaskJoin(#[from] tokio::task::JoinError),
}

/// スマートメーターに接続してセッションが終わるまで収集する
async fn attach_and_collect(
    cfg: &AppConfig,
    credentials: Arc<BrouteCredentials>,
    collector: &Collector,
) -> Result<(), DaemonError> {
    let device = cfg.device.clone();
    let max_attempts = cfg.connect_retry_count;
    // 接続手順はシリアル読み込みでブロックするので専用スレッドで行う
    let session = tokio::task::spawn_blocking(move || {
        SerialMeterSession::attach(&device, &credentials, max_attempts, MINIMUM_SCAN_DURATION)
    })
    .await??;
    collector.run(session).await?;
    Ok(())
}

/// SKSETPWD C 以降のパスワードをマスクするフォーマッタ
struct MaskingRouteBPasswordFormatter;

impl<S, N> FormatEvent<S, N> for MaskingRouteBPasswordFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'writer> FormatFields<'writer> + 'static,
{
    fn format_event(
        &self,
        ctx: &fmt::FmtContext<'_, S, N>,
        mut writer: fmt::format::Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        // まず標準フォーマットをバッファに書き出す
        let mut buf = String::new();
        {
            let temp_writer = fmt::format::Writer::new(&mut buf);
            fmt::format::Format::default().format_event(ctx, temp_writer, event)?;
        }

        // マスク処理
        const PATTERN: &'static str = "SKSETPWD C ";
        if let Some(pos) = buf.find(PATTERN) {
            let start = pos + PATTERN.len();
            let end = (start + 12).min(buf.len() - 1);
            let masking_str = "#".repeat(end - start);
            buf.replace_range(start..end, &masking_str)
        }
        // 出力
        writer.write_str(&buf)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();

    // tracingの設定
    let registry = tracing_subscriber::registry();

    // systemd-journaldに接続
    match tracing_journald::layer() {
        // journaldにログ出力する
        Ok(journald_layer) => registry.with(journald_layer).init(),
        // journaldが使えないので、標準出力にログ出力する
        Err(e) => {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_timer(tracing_subscriber::fmt::time::LocalTime::rfc_3339())
                        .with_file(false)
                        .with_line_number(false)
                        .with_thread_names(false)
                        .with_thread_ids(false)
                        .with_ansi(false)
                        .event_format(MaskingRouteBPasswordFormatter),
                )
                .init();
            tracing::error!("couldn't connect to journald: {}", e)
        }
    }

    let cfg = AppConfig::parse();

    // 設定の検証。ここで弾かれるものは再試行しても直らない。
    let credentials = {
        let id = match RouteBId::from_str(&cfg.route_b_id) {
            Ok(id) => id,
            Err(e) => {
                tracing::error!("{}", e);
                return ExitCode::FAILURE;
            }
        };
        let password = match RouteBPassword::from_str(&cfg.route_b_password) {
            Ok(password) => password,
            Err(e) => {
                tracing::error!("{}", e);
                return ExitCode::FAILURE;
            }
        };
        Arc::new(BrouteCredentials { id, password })
    };
    let schedule = match cfg.schedule() {
        Ok(schedule) => schedule,
        Err(e) => {
            tracing::error!("期間集計スケジュールのcron式が不正: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let exporter = match MetricsExporter::new() {
        Ok(exporter) => Arc::new(exporter),
        Err(e) => {
            tracing::error!("メトリクスを登録できない: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // HTTPサーバー(/, /readiness, /metrics)
    {
        let exporter = exporter.clone();
        let addr = cfg.listen_address;
        tokio::spawn(async move {
            if let Err(e) = exporter::serve_http(exporter, addr).await {
                tracing::error!("{:?}", e);
            }
        });
    }

    let collector = Collector::new(schedule, cfg.refresh_interval(), exporter.clone());

    tracing::info!(
        "{} / {} started.",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    // 接続と収集のサイクルを回し続ける。失敗してもクールダウン後に再始動する。
    loop {
        if let Err(e) = attach_and_collect(&cfg, credentials.clone(), &collector).await {
            tracing::error!("収集サイクルが終了した: {}", e);
        }
        tokio::time::sleep(RESTART_COOLDOWN).await;
    }
}
