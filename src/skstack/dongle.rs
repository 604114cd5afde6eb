// Wi-SUNドングル シリアルコマンド送受信ドライバー
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use crate::skstack::response::{self, PanDescriptor, SkResponse};
use serialport::{DataBits, SerialPort, StopBits};
use std::io::{self, BufRead, BufReader, Write};
use std::net::Ipv6Addr;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// アクティブスキャンの最小時間
pub const MINIMUM_SCAN_DURATION: usize = 4;
/// アクティブスキャン全体の制限時間
pub const SCAN_DEADLINE: Duration = Duration::from_secs(60);
/// 単発コマンドの応答待ち制限時間
const RESPONSE_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SkError {
    #[error("シリアルポートを開けない: {0}")]
    Connection(#[from] serialport::Error),
    #[error(r#"i/o "{0}""#)]
    Io(#[from] io::Error),
    #[error("プロトコルエラー: {0}")]
    Protocol(String),
    #[error("アクティブスキャンがタイムアウトした")]
    ScanTimeout,
    #[error("PANA認証に失敗した: {0}")]
    Join(String),
    #[error("UDP送信に失敗した: {0}")]
    Send(String),
}

/// IPv6アドレスをSKSTACKコマンド表記(大文字4桁区切り)にする
pub fn format_ipv6(addr: &Ipv6Addr) -> String {
    addr.segments().map(|n| format!("{:04X}", n)).join(":")
}

/// Wi-SUNドングル。シリアル回線を占有する。
pub struct SkDongle<R: io::Read, W: io::Write> {
    reader: BufReader<R>,
    writer: W,
    pending: String,        // 読みかけの行
    fragments: Vec<String>, // 複数行応答のパース待ち
}

pub type SerialDongle = SkDongle<Box<dyn SerialPort>, Box<dyn SerialPort>>;

impl SerialDongle {
    /// シリアルポートを開く
    pub fn open(device: &str) -> Result<Self, SkError> {
        let writer = serialport::new(device, 115200)
            .stop_bits(StopBits::One)
            .data_bits(DataBits::Eight)
            .timeout(Duration::from_secs(1))
            .open()?;
        let reader = writer.try_clone()?;
        Ok(Self::from_parts(BufReader::new(reader), writer))
    }
}

impl<R: io::Read, W: io::Write> SkDongle<R, W> {
    pub fn from_parts(reader: BufReader<R>, writer: W) -> Self {
        Self {
            reader,
            writer,
            pending: String::new(),
            fragments: Vec::new(),
        }
    }

    /// コマンドを送信する
    fn write_command(&mut self, command: &[u8]) -> io::Result<()> {
        let s = command
            .iter()
            .map(|n| *n as char)
            .filter(|c| c.is_ascii())
            .collect::<String>();
        tracing::trace!(target: "Tx->", "{}", s.escape_debug());
        self.writer.write_all(command)
    }

    // 1行読み込む。タイムアウトで中断された読みかけの行は次回に持ち越す。
    fn read_line_raw(&mut self) -> io::Result<String> {
        loop {
            let n = self.reader.read_line(&mut self.pending)?;
            if self.pending.ends_with('\n') {
                let line = std::mem::take(&mut self.pending);
                tracing::trace!(target: "<-Rx", "{}", line.escape_debug());
                return Ok(line);
            }
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
            }
        }
    }

    // タイムアウトをRESPONSE_DEADLINEまで許容して1行読む
    fn read_line_checked(&mut self) -> Result<String, SkError> {
        let deadline = Instant::now() + RESPONSE_DEADLINE;
        loop {
            match self.read_line_raw() {
                Ok(line) => return Ok(line),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    if Instant::now() >= deadline {
                        return Err(SkError::Protocol("応答が得られない".to_owned()));
                    }
                }
                Err(e) => return Err(SkError::Io(e)),
            }
        }
    }

    /// 応答を1つ受信する
    pub fn receive(&mut self) -> io::Result<SkResponse> {
        loop {
            let line = self.read_line_raw()?;
            self.fragments.push(line);
            match response::parse_response(self.fragments.concat().as_ref()) {
                Ok((_rest, r)) => {
                    self.fragments.clear();
                    return Ok(r);
                }
                Err(nom::Err::Incomplete(_)) => continue, // つづけて次行を読み込む
                Err(e) => {
                    tracing::trace!(target: "parser", "{:?}", e);
                    self.fragments.clear();
                }
            }
        }
    }

    // OK行まで読み込む
    fn read_until_ok(&mut self) -> Result<Vec<String>, SkError> {
        let deadline = Instant::now() + RESPONSE_DEADLINE;
        let mut lines = Vec::new();
        loop {
            match self.read_line_raw() {
                Ok(line) => {
                    let trimmed = line.trim_end().to_owned();
                    let done = trimmed == "OK";
                    lines.push(trimmed);
                    if done {
                        return Ok(lines);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    if Instant::now() >= deadline {
                        return Err(SkError::Protocol("OK応答が得られない".to_owned()));
                    }
                }
                Err(e) => return Err(SkError::Io(e)),
            }
        }
    }

    /// SKVER: ファームウェアバージョンを問い合わせる
    pub fn version(&mut self) -> Result<String, SkError> {
        self.write_command(b"SKVER\r\n")?;
        let lines = self.read_until_ok()?;
        // 2行目「EVER X.Y.Z」の2番目のトークンがバージョン
        match lines.get(1).and_then(|l| l.split(' ').nth(1)) {
            Some(version) => Ok(version.to_owned()),
            None => Err(SkError::Protocol("SKVER応答が不正".to_owned())),
        }
    }

    /// SKSETPWD: Bルートパスワードを登録する
    pub fn set_password(&mut self, password: &str) -> Result<(), SkError> {
        self.write_command(format!("SKSETPWD C {}\r\n", password).as_bytes())?;
        Ok(())
    }

    /// SKSETRBID: BルートIDを登録する
    pub fn set_route_id(&mut self, id: &str) -> Result<(), SkError> {
        self.write_command(format!("SKSETRBID {}\r\n", id).as_bytes())?;
        Ok(())
    }

    /// SKSCAN: アクティブスキャンでスマートメーターのPANを探す
    ///
    /// PAN情報が揃うまでスキャンを出し直す。制限時間内に揃わなければ
    /// `SkError::ScanTimeout`。
    pub fn scan(&mut self, min_duration: usize) -> Result<PanDescriptor, SkError> {
        self.scan_with_deadline(min_duration, Instant::now() + SCAN_DEADLINE)
    }

    fn scan_with_deadline(
        &mut self,
        min_duration: usize,
        deadline: Instant,
    ) -> Result<PanDescriptor, SkError> {
        let duration = min_duration.max(MINIMUM_SCAN_DURATION);
        loop {
            if Instant::now() >= deadline {
                return Err(SkError::ScanTimeout);
            }
            self.write_command(format!("SKSCAN 2 FFFFFFFF {:X}\r\n", duration).as_bytes())?;
            let mut found: Option<PanDescriptor> = None;
            // アクティブスキャン終了イベント待ち
            loop {
                if Instant::now() >= deadline {
                    return Err(SkError::ScanTimeout);
                }
                match self.receive() {
                    Ok(SkResponse::PanDesc(desc)) => {
                        tracing::debug!("{:?}", desc);
                        found = Some(desc);
                    }
                    // EVENT 22 = アクティブスキャン終了
                    Ok(SkResponse::Event(event)) if event.code == 0x22 => break,
                    Ok(SkResponse::Fail(code)) => {
                        return Err(SkError::Protocol(format!("SKSCAN失敗 ER{:02X}", code)));
                    }
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::TimedOut => continue, // タイムアウトエラーは無視する
                    Err(e) => return Err(SkError::Io(e)),
                }
            }
            match found {
                Some(desc) => return Ok(desc),
                // PAN情報が揃わなかったので少し待ってやり直す
                None => thread::sleep(Duration::from_millis(500)),
            }
        }
    }

    /// SKSREG: 仮想レジスタを設定してOK応答を待つ
    pub fn set_register(&mut self, key: &str, value: &str) -> Result<(), SkError> {
        self.write_command(format!("SKSREG {} {}\r\n", key, value).as_bytes())?;
        loop {
            match self.receive() {
                Ok(SkResponse::Ok) => return Ok(()),
                Ok(SkResponse::Fail(code)) => {
                    return Err(SkError::Protocol(format!(
                        "SKSREG {} 失敗 ER{:02X}",
                        key, code
                    )));
                }
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    return Err(SkError::Protocol(format!("SKSREG {} の応答がない", key)));
                }
                Err(e) => return Err(SkError::Io(e)),
            }
        }
    }

    /// SKLL64: MACアドレスからIPv6リンクローカルアドレスを得る
    pub fn link_local_addr(&mut self, mac_addr: u64) -> Result<Ipv6Addr, SkError> {
        self.write_command(format!("SKLL64 {:016X}\r\n", mac_addr).as_bytes())?;
        // 1行目はコマンドエコーなので捨てる
        let _echo = self.read_line_checked()?;
        let line = self.read_line_checked()?;
        line.trim()
            .parse::<Ipv6Addr>()
            .map_err(|_| SkError::Protocol(format!("SKLL64応答が不正: {}", line.trim())))
    }

    /// SKJOIN: PANA認証を開始して完了イベントを待つ
    pub fn join(&mut self, peer: &Ipv6Addr) -> Result<(), SkError> {
        self.write_command(format!("SKJOIN {}\r\n", format_ipv6(peer)).as_bytes())?;
        loop {
            match self.receive() {
                Ok(SkResponse::Fail(code)) => {
                    return Err(SkError::Join(format!("FAIL ER{:02X}", code)));
                }
                // EVENT 24 = PANA接続失敗
                Ok(SkResponse::Event(event)) if event.code == 0x24 => {
                    return Err(SkError::Join(format!(
                        "EVENT 24 {}",
                        format_ipv6(&event.sender)
                    )));
                }
                // EVENT 25 = PANA接続完了
                Ok(SkResponse::Event(event)) if event.code == 0x25 => break,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::TimedOut => continue, // 認証完了には時間がかかる
                Err(e) => return Err(SkError::Io(e)),
            }
        }
        // 認証完了直後のステータス行は読み捨てる
        match self.read_line_raw() {
            Ok(line) => tracing::trace!("{}", line.escape_debug()),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) => return Err(SkError::Io(e)),
        }
        Ok(())
    }

    /// SKSENDTO: UDPデータグラムを送信してERXUDP応答行を待つ
    ///
    /// データ長は4桁の16進数で前置し、本文はそのまま送る。
    /// 応答のERXUDP行は解釈せずそのまま返す。
    pub fn send_to(
        &mut self,
        handle: u8,
        peer: &Ipv6Addr,
        port: u16,
        security: u8,
        payload: &[u8],
    ) -> Result<String, SkError> {
        let header = format!(
            "SKSENDTO {} {} {:04X} {} {:04X} ",
            handle,
            format_ipv6(peer),
            port,
            security,
            payload.len(),
        );
        let command = [header.as_bytes(), payload, b"\r\n"].concat();
        self.write_command(&command)?;
        loop {
            match self.read_line_raw() {
                Ok(line) => {
                    if line.contains("FAIL ") {
                        return Err(SkError::Send(line.trim_end().to_owned()));
                    }
                    if line.starts_with("ERXUDP ") {
                        return Ok(line);
                    }
                }
                // 応答待ちの打ち切りは呼び出し側の監視に任せる
                Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(e) => return Err(SkError::Io(e)),
            }
        }
    }
}

#[cfg(test)]
// 最後まで読んだあとはシリアルポートと同じくタイムアウトを返し続けるリーダー
struct ScriptedPort {
    data: io::Cursor<Vec<u8>>,
}

#[cfg(test)]
impl ScriptedPort {
    fn new(script: &str) -> BufReader<Self> {
        BufReader::new(Self {
            data: io::Cursor::new(script.as_bytes().to_vec()),
        })
    }
}

#[cfg(test)]
impl io::Read for ScriptedPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.data.read(buf) {
            Ok(0) => Err(io::Error::from(io::ErrorKind::TimedOut)),
            other => other,
        }
    }
}

#[test]
fn test_version() {
    let reader = ScriptedPort::new("SKVER\r\nEVER 1.2.8\r\nOK\r\n");
    let mut dongle = SkDongle::from_parts(reader, Vec::<u8>::new());
    assert_eq!(dongle.version().unwrap(), "1.2.8");
    assert_eq!(&dongle.writer, b"SKVER\r\n");

    let reader = ScriptedPort::new("SKVER\r\nBADRESPONSE\r\nOK\r\n");
    let mut dongle = SkDongle::from_parts(reader, Vec::<u8>::new());
    assert!(matches!(dongle.version(), Err(SkError::Protocol(_))));
}

#[test]
fn test_set_register() {
    // エコーバックに続くOKで成功
    let reader = ScriptedPort::new("SKSREG S2 3B\r\nOK\r\n");
    let mut dongle = SkDongle::from_parts(reader, Vec::<u8>::new());
    assert!(dongle.set_register("S2", "3B").is_ok());

    // OKなしはプロトコルエラー
    let reader = ScriptedPort::new("SKSREG S2 3B\r\n");
    let mut dongle = SkDongle::from_parts(reader, Vec::<u8>::new());
    assert!(matches!(
        dongle.set_register("S2", "3B"),
        Err(SkError::Protocol(_))
    ));

    // FAILもプロトコルエラー
    let reader = ScriptedPort::new("FAIL ER06\r\n");
    let mut dongle = SkDongle::from_parts(reader, Vec::<u8>::new());
    assert!(matches!(
        dongle.set_register("S3", "ABCD"),
        Err(SkError::Protocol(_))
    ));
}

#[test]
fn test_link_local_addr() {
    let reader =
        ScriptedPort::new("SKLL64 001D129012345678\r\nFE80:0000:0000:0000:021D:1290:1234:5678\r\n");
    let mut dongle = SkDongle::from_parts(reader, Vec::<u8>::new());
    let addr = dongle.link_local_addr(0x001D_1290_1234_5678).unwrap();
    assert_eq!(format_ipv6(&addr), "FE80:0000:0000:0000:021D:1290:1234:5678");
}

#[test]
fn test_join() {
    let sender = "FE80:0000:0000:0000:021D:1290:1234:5678";

    // EVENT 25 で成功。後続のステータス行は読み捨てる。
    let script = format!("OK\r\nEVENT 21 {sender} 00\r\nEVENT 25 {sender}\r\nERXUDP...\r\n");
    let mut dongle = SkDongle::from_parts(ScriptedPort::new(&script), Vec::<u8>::new());
    assert!(dongle.join(&sender.parse().unwrap()).is_ok());

    // FAILは失敗行を保持して返す
    let mut dongle = SkDongle::from_parts(ScriptedPort::new("FAIL ER10\r\n"), Vec::<u8>::new());
    match dongle.join(&sender.parse().unwrap()) {
        Err(SkError::Join(line)) => assert_eq!(line, "FAIL ER10"),
        other => panic!("{:?}", other),
    }

    // EVENT 24 (PANA接続失敗)も失敗
    let script = format!("OK\r\nEVENT 24 {sender}\r\n");
    let mut dongle = SkDongle::from_parts(ScriptedPort::new(&script), Vec::<u8>::new());
    assert!(matches!(
        dongle.join(&sender.parse().unwrap()),
        Err(SkError::Join(_))
    ));
}

#[test]
fn test_send_to() {
    let sender = "FE80:0000:0000:0000:021D:1290:1234:5678";
    let peer: Ipv6Addr = sender.parse().unwrap();

    // ERXUDP行はそのまま返る
    let script = format!("OK\r\nEVENT 21 {sender} 00\r\nERXUDP {sender} {sender} 0E1A 0E1A 001D129012345678 1 0004 1081ABCD\r\n");
    let mut dongle = SkDongle::from_parts(ScriptedPort::new(&script), Vec::<u8>::new());
    let line = dongle.send_to(1, &peer, 0x0e1a, 1, &[0x10, 0x81]).unwrap();
    assert!(line.starts_with("ERXUDP "));
    assert!(line.ends_with("\r\n"));
    // コマンドは4桁16進のデータ長前置+本文+CRLF
    let header = format!("SKSENDTO 1 {sender} 0E1A 1 0002 ");
    assert!(dongle.writer.starts_with(header.as_bytes()));
    assert!(dongle.writer.ends_with(&[0x10, 0x81, b'\r', b'\n']));

    // FAILは送信失敗
    let mut dongle = SkDongle::from_parts(ScriptedPort::new("FAIL ER05\r\n"), Vec::<u8>::new());
    assert!(matches!(
        dongle.send_to(1, &peer, 0x0e1a, 1, &[0x10, 0x81]),
        Err(SkError::Send(_))
    ));
}

#[test]
fn test_scan_timeout() {
    struct SilentPort;
    impl io::Read for SilentPort {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::TimedOut))
        }
    }
    let mut dongle = SkDongle::from_parts(BufReader::new(SilentPort), Vec::<u8>::new());
    let deadline = Instant::now() + Duration::from_millis(50);
    match dongle.scan_with_deadline(4, deadline) {
        Err(SkError::ScanTimeout) => {}
        other => panic!("{:?}", other),
    }
}

#[test]
fn test_scan() {
    let sender = "FE80:0000:0000:0000:021D:1290:1234:5678";
    let script = format!(
        "OK\r\nEVENT 20 {sender}\r\nEPANDESC\r\n  Channel:3B\r\n  Channel Page:09\r\n  Pan ID:ABCD\r\n  Addr:12345678ABCDABCD\r\n  LQI:84\r\n  PairID:1234ABCD\r\nEVENT 22 {sender}\r\n"
    );
    let mut dongle = SkDongle::from_parts(ScriptedPort::new(&script), Vec::<u8>::new());
    let pan = dongle
        .scan_with_deadline(4, Instant::now() + Duration::from_secs(5))
        .unwrap();
    assert_eq!(pan.channel, 0x3b);
    assert_eq!(pan.pan_id, 0xabcd);
    assert_eq!(pan.mac_addr, 0x1234_5678_abcd_abcd);
}
