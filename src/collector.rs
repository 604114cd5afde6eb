// 収集スケジューラー(ポーリング制御ループと期間集計)
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use crate::skstack::SkError;
use crate::telemetry::TelemetrySample;
use chrono::{DateTime, Utc};
use chrono_tz::Asia;
use cron::Schedule;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

#[derive(Debug, Error)]
pub enum CollectError {
    #[error("計測値取得がタイムアウトした(セッション打ち切り)")]
    SessionTimeout,
    #[error(r#"取得タスク "{0}""#)]
    FetchTask(#[from] tokio::task::JoinError),
}

/// 計測値の受け手。Noneは取得失敗(サンプル欠落)を表す。
pub trait SampleSink: Send + Sync {
    fn on_sample(&self, sample: Option<&TelemetrySample>);
}

/// 計測値の取得元
pub trait SampleSource: Send + 'static {
    fn fetch(&mut self) -> Result<Option<TelemetrySample>, SkError>;
}

/// スケジュール境界ごとの消費電力量(期間差分)を追跡する
pub struct DeltaTracker {
    schedule: Schedule,
    previous: Option<TelemetrySample>,
    next_boundary: Option<DateTime<Utc>>,
}

impl DeltaTracker {
    pub fn new(schedule: Schedule, now: DateTime<Utc>) -> Self {
        let next_boundary = next_boundary_after(&schedule, now);
        Self {
            schedule,
            previous: None,
            next_boundary,
        }
    }

    /// サンプルに期間差分を書き込む
    ///
    /// 差分を計算し直すのは境界時刻に達したときだけ。それ以外は前回の
    /// 差分を引き継ぎ、絶対値のフィールドだけが新しくなる。
    pub fn apply(&mut self, sample: &mut TelemetrySample) {
        let Some(prev) = self.previous.as_ref() else {
            // 最初のサンプルは基準値。差分は0のまま。
            self.previous = Some(sample.clone());
            return;
        };
        if self.next_boundary.is_some_and(|b| sample.taken_at >= b) {
            sample.window_kwh = sample.cumulative_kwh - prev.cumulative_kwh;
            self.next_boundary = next_boundary_after(&self.schedule, sample.taken_at);
            self.previous = Some(sample.clone());
        } else {
            sample.window_kwh = prev.window_kwh;
        }
    }
}

// 指定時刻より後の次のスケジュール時刻(日本時間で評価)
fn next_boundary_after(schedule: &Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule
        .after(&after.with_timezone(&Asia::Tokyo))
        .next()
        .map(|t| t.to_utc())
}

/// 収集スケジューラー
pub struct Collector {
    schedule: Schedule,
    refresh: Duration,
    sink: Arc<dyn SampleSink>,
}

impl Collector {
    pub fn new(schedule: Schedule, refresh: Duration, sink: Arc<dyn SampleSink>) -> Self {
        Self {
            schedule,
            refresh,
            sink,
        }
    }

    // 1回のフェッチに許す時間
    fn fetch_budget(&self) -> Duration {
        self.refresh * 2
    }

    /// セッションが終わるまでポーリングし続ける
    ///
    /// フェッチの起動はタイマーだけが行い、完了通知は実行中フラグを
    /// 下ろすだけにする(多重起動防止)。制限時間内に終わらないフェッチは
    /// 接続喪失とみなしてセッションごと打ち切る。
    pub async fn run<S: SampleSource>(&self, source: S) -> Result<(), CollectError> {
        let mut tracker = DeltaTracker::new(self.schedule.clone(), Utc::now());
        let mut ticker = time::interval(self.refresh);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        type Fetched<S> = (S, Result<Option<TelemetrySample>, SkError>);
        let mut idle: Option<S> = Some(source);
        let mut busy: Option<JoinHandle<Fetched<S>>> = None;
        let mut deadline = Instant::now() + self.fetch_budget();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if busy.is_none()
                        && let Some(mut source) = idle.take()
                    {
                        busy = Some(tokio::task::spawn_blocking(move || {
                            let result = source.fetch();
                            (source, result)
                        }));
                        deadline = Instant::now() + self.fetch_budget();
                    }
                }
                joined = async { busy.as_mut().expect("busy").await }, if busy.is_some() => {
                    busy = None;
                    let (source, result) = joined?;
                    idle = Some(source);
                    match result {
                        Ok(Some(mut sample)) => {
                            tracker.apply(&mut sample);
                            tracing::debug!(
                                "WH={} kWh, W={} W, A={} A, PF={} %, 期間WH={} kWh",
                                sample.cumulative_kwh,
                                sample.instant_watt,
                                sample.ampere,
                                sample.power_factor,
                                sample.window_kwh
                            );
                            self.sink.on_sample(Some(&sample));
                        }
                        Ok(None) => self.sink.on_sample(None),
                        Err(e) => {
                            // 取得失敗はサンプル欠落として扱う。セッションは継続する。
                            tracing::warn!("計測値取得に失敗した: {}", e);
                            self.sink.on_sample(None);
                        }
                    }
                }
                _ = time::sleep_until(deadline), if busy.is_some() => {
                    // 取得元ごと破棄する(ブロッキングタスクは完了時にハンドルを閉じる)
                    if let Some(task) = busy.take() {
                        task.abort();
                    }
                    return Err(CollectError::SessionTimeout);
                }
            }
        }
    }
}

#[test]
fn test1() {
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    let mk = |at: DateTime<Utc>, kwh: Decimal| TelemetrySample::from_readings(at, kwh, 0, 0, 0);

    // 毎時0分30分のスケジュール。開始は00:10なので次の境界は00:30。
    let schedule = Schedule::from_str("0 0,30 * * * *").unwrap();
    let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 0, 10, 0).unwrap();
    let mut tracker = DeltaTracker::new(schedule, t0);

    // 最初のサンプルは基準値
    let mut s0 = mk(t0, Decimal::new(1000, 1)); // 100.0 kWh
    tracker.apply(&mut s0);
    assert_eq!(s0.window_kwh, Decimal::ZERO);

    // 境界を越えたサンプルで差分を計算する
    let t1 = Utc.with_ymd_and_hms(2025, 6, 1, 0, 31, 0).unwrap();
    let mut s1 = mk(t1, Decimal::new(1025, 1)); // 102.5 kWh
    tracker.apply(&mut s1);
    assert_eq!(s1.window_kwh, Decimal::new(25, 1)); // 2.5 kWh

    // 次の境界(01:00)より前は前回の差分を引き継ぐ。絶対値は新しいまま。
    let t2 = Utc.with_ymd_and_hms(2025, 6, 1, 0, 40, 0).unwrap();
    let mut s2 = mk(t2, Decimal::new(1030, 1)); // 103.0 kWh
    tracker.apply(&mut s2);
    assert_eq!(s2.window_kwh, Decimal::new(25, 1));
    assert_eq!(s2.cumulative_kwh, Decimal::new(1030, 1));

    // 次の境界に達したら計算し直す
    let t3 = Utc.with_ymd_and_hms(2025, 6, 1, 1, 0, 0).unwrap();
    let mut s3 = mk(t3, Decimal::new(1040, 1)); // 104.0 kWh
    tracker.apply(&mut s3);
    assert_eq!(s3.window_kwh, Decimal::new(15, 1)); // 104.0 - 102.5
}

#[test]
fn test2() {
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    // ちょうど境界時刻のサンプルでも計算し直す
    let schedule = Schedule::from_str("0 0,30 * * * *").unwrap();
    let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 0, 10, 0).unwrap();
    let mut tracker = DeltaTracker::new(schedule, t0);

    let mut s0 = TelemetrySample::from_readings(t0, Decimal::new(1000, 1), 0, 0, 0);
    tracker.apply(&mut s0);

    let boundary = Utc.with_ymd_and_hms(2025, 6, 1, 0, 30, 0).unwrap();
    let mut s1 = TelemetrySample::from_readings(boundary, Decimal::new(1025, 1), 0, 0, 0);
    tracker.apply(&mut s1);
    assert_eq!(s1.window_kwh, Decimal::new(25, 1));
}

#[tokio::test]
async fn test3() {
    use rust_decimal::Decimal;
    use std::str::FromStr;
    use std::sync::Mutex;

    // 周期ごとにフェッチしてシンクへ届ける
    struct RecordingSink(Mutex<Vec<Option<Decimal>>>);
    impl SampleSink for RecordingSink {
        fn on_sample(&self, sample: Option<&TelemetrySample>) {
            self.0
                .lock()
                .unwrap()
                .push(sample.map(|s| s.cumulative_kwh));
        }
    }
    struct CountingSource(u32);
    impl SampleSource for CountingSource {
        fn fetch(&mut self) -> Result<Option<TelemetrySample>, SkError> {
            self.0 += 1;
            Ok(Some(TelemetrySample::from_readings(
                Utc::now(),
                Decimal::from(self.0),
                100,
                10,
                5,
            )))
        }
    }

    let schedule = Schedule::from_str("0 0,30 * * * *").unwrap();
    let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
    let collector = Collector::new(schedule, Duration::from_millis(20), sink.clone());
    let _ = time::timeout(
        Duration::from_millis(150),
        collector.run(CountingSource(0)),
    )
    .await;

    let got = sink.0.lock().unwrap();
    assert!(got.len() >= 2);
    assert_eq!(got[0], Some(Decimal::from(1u32)));
    assert_eq!(got[1], Some(Decimal::from(2u32)));
}

#[tokio::test]
async fn test4() {
    use std::str::FromStr;

    // 取得周期の2倍を超えるフェッチはセッションごと打ち切る
    struct StalledSource;
    impl SampleSource for StalledSource {
        fn fetch(&mut self) -> Result<Option<TelemetrySample>, SkError> {
            std::thread::sleep(Duration::from_millis(500));
            Ok(None)
        }
    }
    struct NullSink;
    impl SampleSink for NullSink {
        fn on_sample(&self, _sample: Option<&TelemetrySample>) {}
    }

    let schedule = Schedule::from_str("0 0,30 * * * *").unwrap();
    let collector = Collector::new(schedule, Duration::from_millis(50), Arc::new(NullSink));
    match collector.run(StalledSource).await {
        Err(CollectError::SessionTimeout) => {}
        other => panic!("{:?}", other),
    }
}
