// ECHONET Lite 低圧スマート電力量メータークラスのプロパティ
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use crate::echonetlite::ElProp;
use rust_decimal::Decimal;
use std::fmt;

/// 計測値応答に現れるプロパティ
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Properties {
    EffectiveDigits(EffectiveDigits),
    CumulativeEnergyUnit(CumulativeEnergyUnit),
    CumulativeEnergy(CumulativeEnergy),
    InstantPower(InstantPower),
    InstantCurrent(InstantCurrent),
}

impl TryFrom<&ElProp<'_>> for Properties {
    type Error = String;

    fn try_from(prop: &ElProp) -> Result<Self, Self::Error> {
        match prop.epc {
            EffectiveDigits::EPC => EffectiveDigits::try_from(prop).map(Self::EffectiveDigits),
            CumulativeEnergyUnit::EPC => {
                CumulativeEnergyUnit::try_from(prop).map(Self::CumulativeEnergyUnit)
            }
            CumulativeEnergy::EPC => CumulativeEnergy::try_from(prop).map(Self::CumulativeEnergy),
            InstantPower::EPC => InstantPower::try_from(prop).map(Self::InstantPower),
            InstantCurrent::EPC => InstantCurrent::try_from(prop).map(Self::InstantCurrent),
            _ => Err(format!(
                "UNKNOWN EPC:0x{:02X} EDT:{:?}",
                prop.epc, prop.edt
            )),
        }
    }
}

impl fmt::Display for Properties {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::EffectiveDigits(a) => write!(f, "{}", a),
            Self::CumulativeEnergyUnit(a) => write!(f, "{}", a),
            Self::CumulativeEnergy(a) => write!(f, "{}", a),
            Self::InstantPower(a) => write!(f, "{}", a),
            Self::InstantCurrent(a) => write!(f, "{}", a),
        }
    }
}

/// 0xd7 積算電力量有効桁数
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct EffectiveDigits(pub u8);

impl EffectiveDigits {
    pub const EPC: u8 = 0xd7;
}

impl TryFrom<&ElProp<'_>> for EffectiveDigits {
    type Error = String;

    fn try_from(prop: &ElProp) -> Result<Self, Self::Error> {
        match prop.edt {
            [a] if prop.epc == Self::EPC => Ok(Self(*a)),
            _ => Err(format!("BAD EPC:0x{:02X} EDT:{:?}", prop.epc, prop.edt)),
        }
    }
}

impl fmt::Display for EffectiveDigits {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "積算電力量有効桁数 {} 桁", self.0)
    }
}

/// 0xe1 積算電力量単位(正方向、逆方向計測値)
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct CumulativeEnergyUnit(pub Decimal);

impl CumulativeEnergyUnit {
    pub const EPC: u8 = 0xe1;
}

impl TryFrom<&ElProp<'_>> for CumulativeEnergyUnit {
    type Error = String;

    fn try_from(prop: &ElProp) -> Result<Self, Self::Error> {
        match prop.edt {
            [0x00] if prop.epc == Self::EPC => Ok(Self(Decimal::new(1, 0))), // 1.0 kwh
            [0x01] if prop.epc == Self::EPC => Ok(Self(Decimal::new(1, 1))), // 0.1 kwh
            [0x02] if prop.epc == Self::EPC => Ok(Self(Decimal::new(1, 2))), // 0.01 kwh
            [0x03] if prop.epc == Self::EPC => Ok(Self(Decimal::new(1, 3))), // 0.001 kwh
            [0x04] if prop.epc == Self::EPC => Ok(Self(Decimal::new(1, 4))), // 0.0001 kwh
            [0x0a] if prop.epc == Self::EPC => Ok(Self(Decimal::new(10, 0))), // 10 kwh
            [0x0b] if prop.epc == Self::EPC => Ok(Self(Decimal::new(100, 0))), // 100 kwh
            [0x0c] if prop.epc == Self::EPC => Ok(Self(Decimal::new(1000, 0))), // 1000 kwh
            [0x0d] if prop.epc == Self::EPC => Ok(Self(Decimal::new(10000, 0))), // 10000 kwh
            _ => Err(format!("BAD EPC:0x{:02X} EDT:{:?}", prop.epc, prop.edt)),
        }
    }
}

impl fmt::Display for CumulativeEnergyUnit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "積算電力量単位= {} kwh", self.0)
    }
}

/// 0xe0 積算電力量計測値(正方向計測値)
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct CumulativeEnergy(pub u32);

impl CumulativeEnergy {
    pub const EPC: u8 = 0xe0;

    pub fn kwh(&self, unit: &CumulativeEnergyUnit) -> Decimal {
        Decimal::from(self.0) * unit.0
    }
}

impl TryFrom<&ElProp<'_>> for CumulativeEnergy {
    type Error = String;

    fn try_from(prop: &ElProp) -> Result<Self, Self::Error> {
        match prop.edt {
            &[a, b, c, d] if prop.epc == Self::EPC => Ok(Self(u32::from_be_bytes([a, b, c, d]))),
            _ => Err(format!("BAD EPC:0x{:02X} EDT:{:?}", prop.epc, prop.edt)),
        }
    }
}

impl fmt::Display for CumulativeEnergy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "積算電力量計測値(正方向計測値)={:8}", self.0)
    }
}

/// 0xe7 瞬時電力計測値
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct InstantPower(pub i32);

impl InstantPower {
    pub const EPC: u8 = 0xe7;
}

impl TryFrom<&ElProp<'_>> for InstantPower {
    type Error = String;

    fn try_from(prop: &ElProp) -> Result<Self, Self::Error> {
        match prop.edt {
            // マイナスの値もある
            &[a, b, c, d] if prop.epc == Self::EPC => Ok(Self(i32::from_be_bytes([a, b, c, d]))),
            _ => Err(format!("BAD EPC:0x{:02X} EDT:{:?}", prop.epc, prop.edt)),
        }
    }
}

impl fmt::Display for InstantPower {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "瞬時電力={:5} W", self.0)
    }
}

/// 0xe8 瞬時電流計測値(R相/T相、0.1A単位)
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct InstantCurrent {
    pub r_deciampere: i16,
    pub t_deciampere: Option<i16>,
}

impl InstantCurrent {
    pub const EPC: u8 = 0xe8;
}

impl TryFrom<&ElProp<'_>> for InstantCurrent {
    type Error = String;

    fn try_from(prop: &ElProp) -> Result<Self, Self::Error> {
        match prop.edt {
            &[a, b, c, d] if prop.epc == Self::EPC => {
                let rt = match (i16::from_be_bytes([a, b]), i16::from_be_bytes([c, d])) {
                    (r, 0x7ffe) => (r, None), // 単相2線式
                    (r, t) => (r, Some(t)),
                };
                Ok(Self {
                    r_deciampere: rt.0,
                    t_deciampere: rt.1,
                })
            }
            _ => Err(format!("BAD EPC:0x{:02X} EDT:{:?}", prop.epc, prop.edt)),
        }
    }
}

impl fmt::Display for InstantCurrent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (self.r_deciampere, self.t_deciampere) {
            (r, None) => write!(f, "瞬時電流:(1φ2W) {} dA", r),
            (r, Some(t)) => write!(f, "瞬時電流:(1φ3W) R={} dA, T={} dA", r, t),
        }
    }
}

#[test]
fn test1() {
    // 積算電力量単位の対応表
    let table: [(u8, Decimal); 9] = [
        (0x00, Decimal::new(1, 0)),
        (0x01, Decimal::new(1, 1)),
        (0x02, Decimal::new(1, 2)),
        (0x03, Decimal::new(1, 3)),
        (0x04, Decimal::new(1, 4)),
        (0x0a, Decimal::new(10, 0)),
        (0x0b, Decimal::new(100, 0)),
        (0x0c, Decimal::new(1000, 0)),
        (0x0d, Decimal::new(10000, 0)),
    ];
    for (code, multiplier) in table.iter() {
        let edt = [*code];
        let prop = ElProp {
            epc: CumulativeEnergyUnit::EPC,
            edt: &edt,
        };
        let unit = CumulativeEnergyUnit::try_from(&prop).unwrap();
        assert_eq!(unit.0, *multiplier);
        // 積算電力量の換算はコードごとに正確に一致する
        assert_eq!(CumulativeEnergy(1234).kwh(&unit), Decimal::from(1234) * multiplier);
    }

    // 未定義コードはエラー
    let prop = ElProp {
        epc: CumulativeEnergyUnit::EPC,
        edt: &[0x05],
    };
    assert!(CumulativeEnergyUnit::try_from(&prop).is_err());
}

#[test]
fn test2() {
    let prop = ElProp {
        epc: CumulativeEnergy::EPC,
        edt: &[0x00, 0x00, 0x04, 0xd2],
    };
    let energy = CumulativeEnergy::try_from(&prop).unwrap();
    assert_eq!(energy.0, 1234);
    assert_eq!(
        energy.kwh(&CumulativeEnergyUnit(Decimal::new(1, 1))),
        Decimal::new(1234, 1)
    );

    // EDTが4バイト未満はエラー
    let prop = ElProp {
        epc: CumulativeEnergy::EPC,
        edt: &[0x00, 0x00],
    };
    assert!(CumulativeEnergy::try_from(&prop).is_err());
}

#[test]
fn test3() {
    let prop = ElProp {
        epc: InstantCurrent::EPC,
        edt: &[0x00, 0x14, 0x00, 0x0f],
    };
    assert_eq!(
        InstantCurrent::try_from(&prop).unwrap(),
        InstantCurrent {
            r_deciampere: 20,
            t_deciampere: Some(15),
        }
    );

    // T相 0x7FFE は単相2線式
    let prop = ElProp {
        epc: InstantCurrent::EPC,
        edt: &[0x00, 0x14, 0x7f, 0xfe],
    };
    assert_eq!(
        InstantCurrent::try_from(&prop).unwrap(),
        InstantCurrent {
            r_deciampere: 20,
            t_deciampere: None,
        }
    );

    // 瞬時電力はマイナスの値もある
    let prop = ElProp {
        epc: InstantPower::EPC,
        edt: &[0xff, 0xff, 0xff, 0x38],
    };
    assert_eq!(InstantPower::try_from(&prop).unwrap(), InstantPower(-200));
}
