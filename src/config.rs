// 実行時設定
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use clap::Parser;
use cron::Schedule;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// スマートメーターBルートの計測値をPrometheus形式で公開する。
#[derive(Parser, Debug)]
#[command(name = "hems_metricsd")]
#[command(version, about, long_about = None)]
pub struct AppConfig {
    /// シリアルデバイス名
    #[arg(short = 'D', long, env = "SERIAL_DEVICE", default_value = "/dev/ttyUSB0")]
    pub device: String,

    /// ルートBID(32文字)
    #[arg(long, env = "B_ROUTE_ID")]
    pub route_b_id: String,

    /// ルートBパスワード(12文字)
    #[arg(long, env = "B_ROUTE_PASSWORD")]
    pub route_b_password: String,

    /// 取得周期(秒)
    #[arg(long, env = "REFRESH_SECONDS", default_value_t = 5)]
    pub refresh_seconds: u64,

    /// 接続リトライ回数
    #[arg(long, env = "CONNECT_RETRY_COUNT", default_value_t = 5)]
    pub connect_retry_count: usize,

    /// 期間集計スケジュール(秒フィールドからのcron式)
    #[arg(
        long,
        env = "POWER_CONSUMPTION_CRON_EXPR",
        default_value = "0 0,30 * * * *"
    )]
    pub aggregate_schedule: String,

    /// HTTP待ち受けアドレス
    #[arg(long, env = "LISTEN_ADDRESS", default_value = "0.0.0.0:9000")]
    pub listen_address: SocketAddr,
}

impl AppConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_seconds)
    }

    pub fn schedule(&self) -> Result<Schedule, cron::error::Error> {
        Schedule::from_str(&self.aggregate_schedule)
    }
}

#[test]
fn test1() {
    let cfg = AppConfig::try_parse_from([
        "hems_metricsd",
        "--route-b-id",
        "0123456789ABCDEF0123456789ABCDEF",
        "--route-b-password",
        "0123456789AB",
    ])
    .unwrap();
    assert_eq!(cfg.device, "/dev/ttyUSB0");
    assert_eq!(cfg.refresh_seconds, 5);
    assert_eq!(cfg.connect_retry_count, 5);
    assert_eq!(cfg.listen_address, "0.0.0.0:9000".parse().unwrap());
    // 既定のスケジュールは毎時0分と30分
    assert!(cfg.schedule().is_ok());
}

#[test]
fn test2() {
    let cfg = AppConfig::try_parse_from([
        "hems_metricsd",
        "--route-b-id",
        "0123456789ABCDEF0123456789ABCDEF",
        "--route-b-password",
        "0123456789AB",
        "--refresh-seconds",
        "10",
        "--aggregate-schedule",
        "0 */15 * * * *",
    ])
    .unwrap();
    assert_eq!(cfg.refresh_interval(), Duration::from_secs(10));
    assert!(cfg.schedule().is_ok());

    // 壊れたcron式はエラーになる
    let cfg = AppConfig::try_parse_from([
        "hems_metricsd",
        "--route-b-id",
        "0123456789ABCDEF0123456789ABCDEF",
        "--route-b-password",
        "0123456789AB",
        "--aggregate-schedule",
        "not a cron expr",
    ])
    .unwrap();
    assert!(cfg.schedule().is_err());
}
