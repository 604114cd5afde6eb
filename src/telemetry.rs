// 計測値データーモデル
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};

/// スマートメーターから取得した1回分の計測値
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySample {
    pub taken_at: DateTime<Utc>,
    /// 積算電力量 [kWh]
    pub cumulative_kwh: Decimal,
    /// 瞬時電力 [W]
    pub instant_watt: i32,
    /// 瞬時電流(R相+T相) [A]
    pub ampere: Decimal,
    /// R相電流 [A]
    pub ampere_r: Decimal,
    /// T相電流 [A]
    pub ampere_t: Decimal,
    /// 力率 [%]
    pub power_factor: Decimal,
    /// 集計期間内の消費電力量 [kWh]
    pub window_kwh: Decimal,
}

impl TelemetrySample {
    /// 生の計測値から派生値を計算して組み立てる
    ///
    /// 電流は0.1A単位の整数で受け取る。集計期間内の消費電力量は
    /// スケジューラーが後から書き込むので0で初期化する。
    pub fn from_readings(
        taken_at: DateTime<Utc>,
        cumulative_kwh: Decimal,
        instant_watt: i32,
        r_deciampere: i16,
        t_deciampere: i16,
    ) -> Self {
        let total_deciampere = i32::from(r_deciampere) + i32::from(t_deciampere);
        Self {
            taken_at,
            cumulative_kwh,
            instant_watt,
            ampere: Decimal::new(i64::from(total_deciampere), 1),
            ampere_r: Decimal::new(i64::from(r_deciampere), 1),
            ampere_t: Decimal::new(i64::from(t_deciampere), 1),
            power_factor: power_factor(instant_watt, total_deciampere),
            window_kwh: Decimal::ZERO,
        }
    }
}

// 力率 [%]。100V系を前提に 瞬時電力×1000/(10×電流[0.1A]) を整数に丸めて0.1倍する。
// 電流が0のときは0とする。
fn power_factor(instant_watt: i32, total_deciampere: i32) -> Decimal {
    if total_deciampere == 0 {
        return Decimal::ZERO;
    }
    let raw = Decimal::from(instant_watt) * Decimal::from(1000)
        / (Decimal::from(10) * Decimal::from(total_deciampere));
    raw.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero) * Decimal::new(1, 1)
}

#[test]
fn test1() {
    let taken_at = Utc::now();
    let sample = TelemetrySample::from_readings(taken_at, Decimal::new(1234, 1), 500, 20, 15);
    assert_eq!(sample.cumulative_kwh, Decimal::new(1234, 1)); // 123.4 kWh
    assert_eq!(sample.instant_watt, 500);
    assert_eq!(sample.ampere, Decimal::new(35, 1)); // 3.5 A
    assert_eq!(sample.ampere_r, Decimal::new(20, 1)); // 2.0 A
    assert_eq!(sample.ampere_t, Decimal::new(15, 1)); // 1.5 A
    // round(500*1000/(10*35)) * 0.1 = round(1428.57..) * 0.1 = 142.9
    assert_eq!(sample.power_factor, Decimal::new(1429, 1));
    assert_eq!(sample.window_kwh, Decimal::ZERO);
}

#[test]
fn test2() {
    // 電流が0でも力率は0になるだけで計算は破綻しない
    let sample = TelemetrySample::from_readings(Utc::now(), Decimal::ZERO, 500, 0, 0);
    assert_eq!(sample.power_factor, Decimal::ZERO);
    assert_eq!(sample.ampere, Decimal::ZERO);
}
