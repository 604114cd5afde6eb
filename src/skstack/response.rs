// SKSTACK/IP 応答行のデーターモデルとパーサー
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use nom::branch::alt;
use nom::bytes::complete::{tag, take_while_m_n};
use nom::character::complete::{crlf, hex_digit1, space0, space1};
use nom::combinator::{map, map_res, opt};
use nom::multi::{many0, separated_list1};
use nom::{Parser, bytes};
use std::net::Ipv6Addr;

/// EVENT行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkEvent {
    pub code: u8,
    pub sender: Ipv6Addr,
    pub param: Option<u8>,
}

/// EPANDESC応答(アクティブスキャンで見つけたPANの情報)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanDescriptor {
    pub channel: u8,
    pub channel_page: u8,
    pub pan_id: u16,
    pub mac_addr: u64,
    pub lqi: u8,
    pub pair_id: u32,
}

/// ERXUDP応答(UDP受信通知)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxUdp {
    pub sender: Ipv6Addr,
    pub destination: Ipv6Addr,
    pub sender_port: u16,
    pub destination_port: u16,
    pub sender_lla: u64, // 送信元のMAC層アドレス
    pub secured: u8,     // 1:暗号化あり, 0:暗号化なし
    pub datalen: u16,
    pub data: Vec<u8>,
}

/// SKSTACK応答
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkResponse {
    Ok,
    Fail(u8),
    Event(SkEvent),
    PanDesc(PanDescriptor),
    RxUdp(RxUdp),
    Blank, // 空行
}

// 8ビット16進数(任意桁)
fn u8_hex(input: &str) -> nom::IResult<&str, u8> {
    map_res(hex_digit1, |hexd| u8::from_str_radix(hexd, 16)).parse(input)
}

// 8ビット16進数(2桁固定)
fn u8_hex2(input: &str) -> nom::IResult<&str, u8> {
    map_res(take_while_m_n(2, 2, |c: char| c.is_ascii_hexdigit()), |s| {
        u8::from_str_radix(s, 16)
    })
    .parse(input)
}

// 16ビット16進数(任意桁)
fn u16_hex(input: &str) -> nom::IResult<&str, u16> {
    map_res(hex_digit1, |hexd| u16::from_str_radix(hexd, 16)).parse(input)
}

// 64ビット16進数(任意桁)
fn u64_hex(input: &str) -> nom::IResult<&str, u64> {
    map_res(hex_digit1, |hexd| u64::from_str_radix(hexd, 16)).parse(input)
}

// Ipv6アドレス(FE80:0000:0000:0000:0000:0000:0000:0000)
fn ipv6addr(s: &str) -> nom::IResult<&str, Ipv6Addr> {
    let parser = separated_list1(tag(":"), hex_digit1);
    map_res(parser, |xs: Vec<&str>| xs.join(":").parse::<Ipv6Addr>()).parse(s)
}

// OK\r\n
fn rx_ok(input: &str) -> nom::IResult<&str, SkResponse> {
    map((tag("OK"), crlf), |_| SkResponse::Ok).parse(input)
}

// FAIL ERxx\r\n
fn rx_fail(input: &str) -> nom::IResult<&str, SkResponse> {
    let parser = (tag("FAIL ER"), u8_hex2, crlf);
    map(parser, |(_tag, code, _crlf)| SkResponse::Fail(code)).parse(input)
}

// EVENT xx FE80:0000:0000:0000:0000:0000:0000:0000 yy\r\n
fn rx_event(s: &str) -> nom::IResult<&str, SkResponse> {
    let (s, _) = tag("EVENT").parse(s)?;
    let (s, _) = space1.parse(s)?;
    let (s, code) = u8_hex.parse(s)?;
    let (s, _) = space1.parse(s)?;
    let (s, sender) = ipv6addr.parse(s)?;
    let (s, _) = space0.parse(s)?;
    let (s, param) = opt(u8_hex).parse(s)?;
    let (s, _) = crlf.parse(s)?;
    Ok((s, SkResponse::Event(SkEvent { code, sender, param })))
}

// EPANDESC(7行の複数行応答)
fn rx_pandesc(s: &str) -> nom::IResult<&str, SkResponse> {
    // 1行目
    let (s, _) = (tag("EPANDESC"), crlf).parse(s)?;
    // 2行目以降は2文字の字下げ付き
    let (s, _) = bytes::streaming::tag("  ").parse(s)?;
    let (s, channel) = map((tag("Channel:"), u64_hex, crlf), |(_, n, _)| n as u8).parse(s)?;
    let (s, _) = bytes::streaming::tag("  ").parse(s)?;
    let (s, channel_page) =
        map((tag("Channel Page:"), u64_hex, crlf), |(_, n, _)| n as u8).parse(s)?;
    let (s, _) = bytes::streaming::tag("  ").parse(s)?;
    let (s, pan_id) = map((tag("Pan ID:"), u64_hex, crlf), |(_, n, _)| n as u16).parse(s)?;
    let (s, _) = bytes::streaming::tag("  ").parse(s)?;
    let (s, (_, mac_addr, _)) = (tag("Addr:"), u64_hex, crlf).parse(s)?;
    let (s, _) = bytes::streaming::tag("  ").parse(s)?;
    let (s, lqi) = map((tag("LQI:"), u64_hex, crlf), |(_, n, _)| n as u8).parse(s)?;
    let (s, _) = bytes::streaming::tag("  ").parse(s)?;
    let (s, pair_id) = map((tag("PairID:"), u64_hex, crlf), |(_, n, _)| n as u32).parse(s)?;

    let pandesc = PanDescriptor {
        channel,
        channel_page,
        pan_id,
        mac_addr,
        lqi,
        pair_id,
    };

    Ok((s, SkResponse::PanDesc(pandesc)))
}

// ERXUDP <送信元> <送信先> <送信元ポート> <送信先ポート> <送信元MAC層アドレス> <暗号化> <データ長> <データ>\r\n
fn rx_rxudp(s: &str) -> nom::IResult<&str, SkResponse> {
    let (s, _) = tag("ERXUDP").parse(s)?;
    let (s, _) = space1.parse(s)?;
    let (s, sender) = ipv6addr.parse(s)?;
    let (s, _) = space1.parse(s)?;
    let (s, destination) = ipv6addr.parse(s)?;
    let (s, _) = space1.parse(s)?;
    let (s, sender_port) = u16_hex.parse(s)?;
    let (s, _) = space1.parse(s)?;
    let (s, destination_port) = u16_hex.parse(s)?;
    let (s, _) = space1.parse(s)?;
    let (s, sender_lla) = u64_hex.parse(s)?;
    let (s, _) = space1.parse(s)?;
    let (s, secured) = u8_hex.parse(s)?;
    let (s, _) = space1.parse(s)?;
    let (s, datalen) = u16_hex.parse(s)?;
    let (s, _) = space1.parse(s)?;
    // 受信データ(16進テキスト)
    let (s, data) = many0(u8_hex2).parse(s)?;
    let (s, _) = crlf.parse(s)?;

    let rxudp = RxUdp {
        sender,
        destination,
        sender_port,
        destination_port,
        sender_lla,
        secured,
        datalen,
        data,
    };

    Ok((s, SkResponse::RxUdp(rxudp)))
}

/// 応答行を解析する
pub fn parse_response(input: &str) -> nom::IResult<&str, SkResponse> {
    alt((
        // 以下のどれか
        map((space0, crlf), |_| SkResponse::Blank), // 空行
        rx_ok,
        rx_fail,
        rx_event,
        rx_pandesc,
        rx_rxudp,
    ))
    .parse(input)
}

#[test]
fn test1() {
    assert_eq!(parse_response("\r\n").unwrap(), ("", SkResponse::Blank));

    assert_eq!(parse_response(" \r\n").unwrap(), ("", SkResponse::Blank));

    assert_eq!(parse_response("OK\r\n").unwrap(), ("", SkResponse::Ok));

    assert_eq!(
        parse_response("FAIL ER10\r\n").unwrap(),
        ("", SkResponse::Fail(16))
    );

    assert_eq!(u64_hex("FF00").unwrap(), ("", 0xff00));
}

#[test]
fn test2() {
    let sender = "FE80:0000:0000:0000:0000:0000:0000:0000";

    assert_eq!(
        parse_response(&format!("EVENT 02 {}\r\n", sender)).unwrap(),
        (
            "",
            SkResponse::Event(SkEvent {
                code: 2,
                sender: sender.parse().unwrap(),
                param: None,
            })
        )
    );

    assert_eq!(
        parse_response(&format!("EVENT 21 {} 02\r\n", sender)).unwrap(),
        (
            "",
            SkResponse::Event(SkEvent {
                code: 33,
                sender: sender.parse().unwrap(),
                param: Some(2),
            })
        )
    );

    assert_eq!(
        parse_response(&format!("EVENT 22 {}\r\n", sender)).unwrap(),
        (
            "",
            SkResponse::Event(SkEvent {
                code: 0x22,
                sender: sender.parse().unwrap(),
                param: None,
            })
        )
    );
}

#[test]
fn test3() {
    let sender: Ipv6Addr = "FE80:0001:0002:0003:0004:0005:0006:0007".parse().unwrap();
    let destination: Ipv6Addr = "FE80:0008:0009:000a:000b:000c:000d:000e".parse().unwrap();
    let sender_lla = 0x1234_5678_9abc_0000u64;
    let datalen = 16;
    let data = "000102030405060708090A0B0C0D0E0F";
    let line = format!(
        "ERXUDP {} {} 0E1A 0E1A {:X} 1 {:02X} {}\r\n",
        sender.segments().map(|n| format!("{:04X}", n)).join(":"),
        destination
            .segments()
            .map(|n| format!("{:04X}", n))
            .join(":"),
        sender_lla,
        datalen,
        data
    );

    assert_eq!(
        parse_response(&line).unwrap(),
        (
            "",
            SkResponse::RxUdp(RxUdp {
                sender,
                destination,
                sender_port: 0x0e1a,
                destination_port: 0x0e1a,
                sender_lla,
                secured: 1,
                datalen,
                data: vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15],
            })
        )
    );
}

#[test]
fn test4() {
    let pandesc = vec![
        "EPANDESC\r\n",
        "  Channel:3B\r\n",
        "  Channel Page:09\r\n",
        "  Pan ID:ABCD\r\n",
        "  Addr:12345678ABCDABCD\r\n",
        "  LQI:84\r\n",
        "  PairID:1234ABCD\r\n",
    ];

    let expected = PanDescriptor {
        channel: 59,
        channel_page: 9,
        pan_id: 0xABCD,
        mac_addr: 0x1234_5678_ABCD_ABCD,
        lqi: 132,
        pair_id: 0x1234_ABCD,
    };

    assert_eq!(
        parse_response(&pandesc.concat()).unwrap(),
        ("", SkResponse::PanDesc(expected.clone())),
    );

    // 行が揃うまではIncompleteが返る
    let incomplete = nom::Err::Incomplete(nom::Needed::new(2));
    for n in 1..pandesc.len() {
        let partial = &pandesc[..n];
        assert_eq!(parse_response(&partial.concat()).unwrap_err(), incomplete);
    }
    assert_eq!(
        parse_response(&pandesc.concat()).unwrap(),
        ("", SkResponse::PanDesc(expected)),
    );
}
