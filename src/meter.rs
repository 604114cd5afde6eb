// スマートメーターセッション(Bルート接続と計測値取得)
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use crate::collector::SampleSource;
use crate::echonetlite::{self, ElFrame, smart_meter as SM};
use crate::skstack::{self, SerialDongle, SkDongle, SkError, SkResponse, response};
use crate::telemetry::TelemetrySample;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serialport::SerialPort;
use std::io;
use std::net::Ipv6Addr;
use std::sync::LazyLock;
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// ECHONET LiteのUDPポート番号
const ECHONET_LITE_PORT: u16 = 0x0e1a;

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("スマートメーターに接続できない({attempts}回試行): {source}")]
    Exhausted {
        attempts: usize,
        #[source]
        source: SkError,
    },
}

#[derive(PartialEq, Eq)]
/// ルートBID
pub struct RouteBId([char; 32]);

impl std::str::FromStr for RouteBId {
    type Err = String;
    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.chars()
            .collect::<Vec<char>>()
            .try_into()
            .map(Self)
            .map_err(|_| "ルートBIDは32文字固定長です".to_string())
    }
}

impl std::fmt::Display for RouteBId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0.iter().collect::<String>())
    }
}

#[derive(PartialEq, Eq)]
/// ルートBパスワード
pub struct RouteBPassword([char; 12]);

impl std::str::FromStr for RouteBPassword {
    type Err = String;
    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.chars()
            .collect::<Vec<char>>()
            .try_into()
            .map(Self)
            .map_err(|_| "ルートBパスワードは12文字固定長です".to_string())
    }
}

impl std::fmt::Display for RouteBPassword {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0.iter().collect::<String>())
    }
}

#[derive(PartialEq, Eq)]
/// Bルート認証情報
pub struct BrouteCredentials {
    pub id: RouteBId,
    pub password: RouteBPassword,
}

/// 計測値取得のGet要求電文(単位・積算電力量・有効桁数・瞬時電力・瞬時電流)
static METER_READINGS_REQUEST: LazyLock<ElFrame<'static>> = LazyLock::new(|| {
    ElFrame::get_request(
        1,
        &[
            SM::CumulativeEnergyUnit::EPC,
            SM::CumulativeEnergy::EPC,
            SM::EffectiveDigits::EPC,
            SM::InstantPower::EPC,
            SM::InstantCurrent::EPC,
        ],
    )
});

/// 1回の接続セッション。シリアルハンドルを占有する。
pub struct MeterSession<R: io::Read, W: io::Write> {
    dongle: SkDongle<R, W>,
    peer: Ipv6Addr,
}

pub type SerialMeterSession = MeterSession<Box<dyn SerialPort>, Box<dyn SerialPort>>;

impl SerialMeterSession {
    /// 接続手順全体を規定回数までリトライして接続する
    ///
    /// リトライのたびにスキャン時間を1秒ずつ延ばし、シリアルポートも
    /// 開き直す。
    pub fn attach(
        device: &str,
        credentials: &BrouteCredentials,
        max_attempts: usize,
        min_scan_duration: usize,
    ) -> Result<Self, AttachError> {
        let mut last: Option<SkError> = None;
        for attempt in 0..max_attempts {
            match Self::attach_once(device, credentials, min_scan_duration + attempt) {
                Ok(session) => return Ok(session),
                Err(e) => {
                    tracing::warn!("接続試行 {}/{} 失敗: {}", attempt + 1, max_attempts, e);
                    last = Some(e);
                }
            }
        }
        Err(AttachError::Exhausted {
            attempts: max_attempts,
            source: last.unwrap_or_else(|| SkError::Protocol("接続を試行していない".to_owned())),
        })
    }

    // 接続手順: open → 1秒待ち → SKVER → SKSETPWD → SKSETRBID → SKSCAN
    // → SKSREG S2/S3 → SKLL64 → SKJOIN
    fn attach_once(
        device: &str,
        credentials: &BrouteCredentials,
        scan_duration: usize,
    ) -> Result<Self, SkError> {
        let mut dongle = SerialDongle::open(device)?;
        // ドングルが落ち着くまで待つ
        thread::sleep(Duration::from_secs(1));
        let version = dongle.version()?;
        tracing::info!("SKVER {}", version);
        dongle.set_password(&credentials.password.to_string())?;
        dongle.set_route_id(&credentials.id.to_string())?;
        let pan = dongle.scan(scan_duration)?;
        tracing::info!(
            "PAN発見 channel={:02X} pan_id={:04X} lqi={}",
            pan.channel,
            pan.pan_id,
            pan.lqi
        );
        dongle.set_register("S2", &format!("{:02X}", pan.channel))?;
        dongle.set_register("S3", &format!("{:04X}", pan.pan_id))?;
        let peer = dongle.link_local_addr(pan.mac_addr)?;
        tracing::debug!("リンクローカルアドレス {}", skstack::format_ipv6(&peer));
        dongle.join(&peer)?;
        Ok(MeterSession { dongle, peer })
    }
}

impl<R: io::Read, W: io::Write> MeterSession<R, W> {
    /// 計測値を1回取得する
    ///
    /// 応答を計測値として解釈できない場合は`Ok(None)`。呼び出し側は
    /// サンプル欠落として扱い、セッションは継続する。
    pub fn fetch(&mut self) -> Result<Option<TelemetrySample>, SkError> {
        let payload = METER_READINGS_REQUEST
            .encode()
            .map_err(|e| SkError::Protocol(format!("電文エンコード失敗: {e}")))?;
        let line = self
            .dongle
            .send_to(1, &self.peer, ECHONET_LITE_PORT, 1, &payload)?;
        Ok(decode_response_line(&line, Utc::now()))
    }

    /// セッションを終了してシリアルハンドルを解放する
    pub fn disconnect(self) {}
}

impl<R, W> SampleSource for MeterSession<R, W>
where
    R: io::Read + Send + 'static,
    W: io::Write + Send + 'static,
{
    fn fetch(&mut self) -> Result<Option<TelemetrySample>, SkError> {
        MeterSession::fetch(self)
    }
}

/// ERXUDP応答行をTelemetrySampleへ解釈する
pub fn decode_response_line(line: &str, taken_at: DateTime<Utc>) -> Option<TelemetrySample> {
    let udp = match response::parse_response(line) {
        Ok((_rest, SkResponse::RxUdp(udp))) => udp,
        _ => {
            tracing::warn!("ERXUDP行を解釈できない: {}", line.trim_end());
            return None;
        }
    };
    // ECHONET Lite以外のUDPポート宛(PANA等)は計測値ではない
    if udp.destination_port != ECHONET_LITE_PORT {
        tracing::warn!("宛先ポート{:04X}はECHONET Liteではない", udp.destination_port);
        return None;
    }
    let Some(frame) = ElFrame::parse(&udp.data) else {
        tracing::warn!("ECHONET Lite電文が短すぎる");
        return None;
    };
    // スマートメーターからのGet応答だけを受け付ける
    if frame.seoj != echonetlite::EOJ_SMART_METER || frame.esv != echonetlite::ESV_GET_RES {
        tracing::warn!(
            "SEOJ {:02X?} / ESV 0x{:02X} は期待した応答ではない",
            frame.seoj,
            frame.esv
        );
        return None;
    }

    let mut unit = Decimal::ONE;
    let mut cumulative_raw: u32 = 0;
    let mut instant_watt: i32 = 0;
    let mut r_deciampere: i16 = 0;
    let mut t_deciampere: i16 = 0;
    for prop in frame.props.iter() {
        match SM::Properties::try_from(prop) {
            Ok(SM::Properties::EffectiveDigits(digits)) => {
                // 有効桁数は今のところ丸めに使っていない
                tracing::debug!("{}", digits);
            }
            Ok(SM::Properties::CumulativeEnergyUnit(u)) => unit = u.0,
            Ok(SM::Properties::CumulativeEnergy(energy)) => cumulative_raw = energy.0,
            Ok(SM::Properties::InstantPower(power)) => instant_watt = power.0,
            Ok(SM::Properties::InstantCurrent(current)) => {
                r_deciampere = current.r_deciampere;
                t_deciampere = current.t_deciampere.unwrap_or(0); // 単相2線式はT相なし
            }
            // 解釈できないプロパティは既定値のまま読み飛ばす
            Err(e) => tracing::warn!("{}", e),
        }
    }
    let cumulative_kwh = Decimal::from(cumulative_raw) * unit;
    Some(TelemetrySample::from_readings(
        taken_at,
        cumulative_kwh,
        instant_watt,
        r_deciampere,
        t_deciampere,
    ))
}

#[cfg(test)]
fn erxudp_line(port: &str, data_hex: &str) -> String {
    let addr = "FE80:0000:0000:0000:021D:1290:1234:5678";
    format!(
        "ERXUDP {addr} {addr} 0E1A {port} 001D129012345678 1 {:04X} {data_hex}\r\n",
        data_hex.len() / 2
    )
}

#[test]
fn test1() {
    // D7(桁数1) E1(単位0.1) E0(1234) E7(500W) E8(R=2.0A,T=1.5A) のGet応答
    let data = "1081000102880105FF017205D70101E10101E004000004D2E704000001F4E8040014000F";
    let line = erxudp_line("0E1A", data);
    let sample = decode_response_line(&line, Utc::now()).unwrap();
    assert_eq!(sample.cumulative_kwh, Decimal::new(1234, 1)); // 123.4 kWh
    assert_eq!(sample.instant_watt, 500);
    assert_eq!(sample.ampere, Decimal::new(35, 1)); // 3.5 A
    assert_eq!(sample.ampere_r, Decimal::new(20, 1));
    assert_eq!(sample.ampere_t, Decimal::new(15, 1));
    assert_eq!(sample.power_factor, Decimal::new(1429, 1));
    assert_eq!(sample.window_kwh, Decimal::ZERO);
}

#[test]
fn test2() {
    // SEOJがスマートメーターでない応答は受け付けない
    let data = "1081000105FF010288017205D70101E10101E004000004D2E704000001F4E8040014000F";
    assert_eq!(decode_response_line(&erxudp_line("0E1A", data), Utc::now()), None);

    // ESVがGet応答でない(Get_SNA)ものも受け付けない
    let data = "1081000102880105FF015205D70101E10101E004000004D2E704000001F4E8040014000F";
    assert_eq!(decode_response_line(&erxudp_line("0E1A", data), Utc::now()), None);

    // 宛先ポートがECHONET Liteでない(PANA)ものも受け付けない
    let data = "1081000102880105FF017205D70101E10101E004000004D2E704000001F4E8040014000F";
    assert_eq!(decode_response_line(&erxudp_line("02CC", data), Utc::now()), None);

    // ERXUDPの形式を成していない行も受け付けない
    assert_eq!(
        decode_response_line("ERXUDP FE80:0000:0000:0000:021D:1290:1234:5678 0E1A\r\n", Utc::now()),
        None
    );
}

#[test]
fn test3() {
    // E0のEDTが途中で切れていても他のプロパティは生きる
    let data = "1081000102880105FF017205D70101E10101E704000001F4E8040014000FE0040000";
    let sample = decode_response_line(&erxudp_line("0E1A", data), Utc::now()).unwrap();
    assert_eq!(sample.cumulative_kwh, Decimal::ZERO);
    assert_eq!(sample.instant_watt, 500);
    assert_eq!(sample.ampere, Decimal::new(35, 1));

    // 未知のEPCが混ざっていても読み飛ばす
    let data = "1081000102880105FF017202E202ABCDE704000001F4";
    let sample = decode_response_line(&erxudp_line("0E1A", data), Utc::now()).unwrap();
    assert_eq!(sample.instant_watt, 500);
    assert_eq!(sample.cumulative_kwh, Decimal::ZERO);
}

#[test]
fn test4() {
    use std::str::FromStr;

    // 認証情報は固定長
    assert!(RouteBId::from_str("0123456789ABCDEF0123456789ABCDEF").is_ok());
    assert!(RouteBId::from_str("0123456789ABCDEF").is_err());
    assert!(RouteBPassword::from_str("0123456789AB").is_ok());
    assert!(RouteBPassword::from_str("0123456789ABCD").is_err());

    let id = RouteBId::from_str("0123456789ABCDEF0123456789ABCDEF").unwrap();
    assert_eq!(id.to_string(), "0123456789ABCDEF0123456789ABCDEF");
}
