// ECHONET Lite FRAME
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use bincode;
use core::result;

/// ECHONET Lite電文ヘッダ
pub const EHD_ECHONET_LITE: u16 = 0x1081;
/// 低圧スマート電力量メータクラスのEOJ
pub const EOJ_SMART_METER: [u8; 3] = [0x02, 0x88, 0x01];
/// コントローラクラスのEOJ
pub const EOJ_CONTROLLER: [u8; 3] = [0x05, 0xff, 0x01];
/// ESV: プロパティ値読み出し要求
pub const ESV_GET: u8 = 0x62;
/// ESV: プロパティ値読み出し応答
pub const ESV_GET_RES: u8 = 0x72;

/// EPC/EDTの組
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct ElProp<'a> {
    pub epc: u8,
    pub edt: &'a [u8],
}

/// ECHONET Lite電文
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct ElFrame<'a> {
    pub ehd: u16,
    pub tid: u16,
    pub seoj: [u8; 3],
    pub deoj: [u8; 3],
    pub esv: u8,
    pub props: Vec<ElProp<'a>>,
}

impl ElFrame<'static> {
    /// スマートメーター宛のGet要求を組み立てる
    pub fn get_request(tid: u16, epcs: &[u8]) -> Self {
        ElFrame {
            ehd: EHD_ECHONET_LITE,
            tid,
            seoj: EOJ_CONTROLLER,
            deoj: EOJ_SMART_METER,
            esv: ESV_GET,
            props: epcs.iter().map(|&epc| ElProp { epc, edt: &[] }).collect(),
        }
    }
}

impl<'a> ElFrame<'a> {
    /// 送信用バイト列にする
    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        let config = bincode::config::standard()
            .with_big_endian()
            .with_fixed_int_encoding();
        bincode::encode_to_vec(self, config)
    }

    /// 受信データグラムを解釈する
    ///
    /// プロパティ部は電文の末尾まで歩く。宣言長(PDC)が残りバイト数を
    /// 超えていたらそのプロパティを捨てて打ち切る。
    pub fn parse(data: &'a [u8]) -> Option<ElFrame<'a>> {
        let header = data.get(..12)?;
        let ehd = u16::from_be_bytes([header[0], header[1]]);
        let tid = u16::from_be_bytes([header[2], header[3]]);
        let seoj = [header[4], header[5], header[6]];
        let deoj = [header[7], header[8], header[9]];
        let esv = header[10];
        let opc = header[11];
        let mut props = Vec::with_capacity(opc as usize);
        let mut pos = 12;
        while pos + 2 <= data.len() {
            let epc = data[pos];
            let pdc = data[pos + 1] as usize;
            let Some(edt) = data.get(pos + 2..pos + 2 + pdc) else {
                tracing::warn!("EPC 0x{:02X} のEDTが途中で切れている", epc);
                break;
            };
            props.push(ElProp { epc, edt });
            pos += 2 + pdc;
        }
        Some(ElFrame {
            ehd,
            tid,
            seoj,
            deoj,
            esv,
            props,
        })
    }
}

impl<'a> bincode::Encode for ElFrame<'a> {
    fn encode<E: bincode::enc::Encoder>(
        &self,
        encoder: &mut E,
    ) -> result::Result<(), bincode::error::EncodeError> {
        bincode::Encode::encode(&self.ehd, encoder)?;
        bincode::Encode::encode(&self.tid, encoder)?;
        bincode::Encode::encode(&self.seoj, encoder)?;
        bincode::Encode::encode(&self.deoj, encoder)?;
        bincode::Encode::encode(&self.esv, encoder)?;
        bincode::Encode::encode(&(self.props.len() as u8), encoder)?;
        for v in &self.props {
            bincode::Encode::encode(v, encoder)?;
        }
        Ok(())
    }
}

impl<'a> bincode::Encode for ElProp<'a> {
    fn encode<E: bincode::enc::Encoder>(
        &self,
        encoder: &mut E,
    ) -> result::Result<(), bincode::error::EncodeError> {
        bincode::Encode::encode(&self.epc, encoder)?;
        bincode::Encode::encode(&(self.edt.len() as u8), encoder)?;
        for v in self.edt {
            bincode::Encode::encode(v, encoder)?;
        }
        Ok(())
    }
}

#[test]
fn test1() {
    // 計測値取得のGet要求電文
    let frame = ElFrame::get_request(1, &[0xe1, 0xe0, 0xd7, 0xe7, 0xe8]);

    let binary: Vec<u8> = vec![
        0x10, 0x81, //
        0x00, 0x01, //
        0x05, 0xff, 0x01, //
        0x02, 0x88, 0x01, //
        0x62, //
        0x05, //
        0xe1, 0x00, //
        0xe0, 0x00, //
        0xd7, 0x00, //
        0xe7, 0x00, //
        0xe8, 0x00, //
    ];
    assert_eq!(frame.encode().unwrap(), binary);
}

#[test]
fn test2() {
    let binary: Vec<u8> = vec![
        0x10, 0x81, //
        0x00, 0x01, //
        0x02, 0x88, 0x01, //
        0x05, 0xff, 0x01, //
        0x72, //
        0x02, //
        0xe7, 0x04, 0x00, 0x00, 0x01, 0xf4, //
        0xe8, 0x04, 0x00, 0x14, 0x00, 0x0f, //
    ];

    let frame = ElFrame::parse(&binary).unwrap();
    assert_eq!(frame.ehd, EHD_ECHONET_LITE);
    assert_eq!(frame.seoj, EOJ_SMART_METER);
    assert_eq!(frame.deoj, EOJ_CONTROLLER);
    assert_eq!(frame.esv, ESV_GET_RES);
    assert_eq!(
        frame.props,
        vec![
            ElProp {
                epc: 0xe7,
                edt: &[0x00, 0x00, 0x01, 0xf4]
            },
            ElProp {
                epc: 0xe8,
                edt: &[0x00, 0x14, 0x00, 0x0f]
            },
        ]
    );
}

#[test]
fn test3() {
    // ヘッダに満たない電文
    assert_eq!(ElFrame::parse(&[0x10, 0x81, 0x00]), None);

    // 宣言長が残りより長いプロパティは捨てて、それまでの分を返す
    let binary: Vec<u8> = vec![
        0x10, 0x81, //
        0x00, 0x01, //
        0x02, 0x88, 0x01, //
        0x05, 0xff, 0x01, //
        0x72, //
        0x02, //
        0xe7, 0x04, 0x00, 0x00, 0x01, 0xf4, //
        0xe0, 0x04, 0x00, 0x00, // 4バイト宣言で2バイトしかない
    ];
    let frame = ElFrame::parse(&binary).unwrap();
    assert_eq!(frame.props.len(), 1);
    assert_eq!(frame.props[0].epc, 0xe7);
}
