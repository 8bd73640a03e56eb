//! Modbus RTU application data units
//!
//! An ADU is `slave | function | data.. | crc_lo | crc_hi`. Only the
//! function codes a polling master needs are supported.

use crate::error::{RadapterError, Result};

pub const READ_COILS: u8 = 0x01;
pub const READ_DISCRETE_INPUTS: u8 = 0x02;
pub const READ_HOLDING_REGISTERS: u8 = 0x03;
pub const READ_INPUT_REGISTERS: u8 = 0x04;
pub const WRITE_SINGLE_COIL: u8 = 0x05;
pub const WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Bit set in the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;
/// Length of an exception ADU
pub const EXCEPTION_LEN: usize = 5;

/// Largest register count of one read (FC 3/4)
pub const MAX_READ_REGISTERS: u16 = 125;
/// Largest bit count of one read (FC 1/2)
pub const MAX_READ_BITS: u16 = 2000;
/// Largest register count of one write (FC 16)
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// CRC-16/MODBUS (poly 0xA001 reflected, init 0xFFFF)
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// A master request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// FC 1 or 2
    ReadBits { function: u8, start: u16, count: u16 },
    /// FC 3 or 4
    ReadWords { function: u8, start: u16, count: u16 },
    WriteCoil { address: u16, value: bool },
    WriteRegister { address: u16, value: u16 },
    WriteRegisters { start: u16, values: Vec<u16> },
}

impl Request {
    pub fn function(&self) -> u8 {
        match self {
            Request::ReadBits { function, .. } | Request::ReadWords { function, .. } => *function,
            Request::WriteCoil { .. } => WRITE_SINGLE_COIL,
            Request::WriteRegister { .. } => WRITE_SINGLE_REGISTER,
            Request::WriteRegisters { .. } => WRITE_MULTIPLE_REGISTERS,
        }
    }

    /// Build the ADU for `slave`
    pub fn encode(&self, slave: u8) -> Vec<u8> {
        let mut adu = vec![slave, self.function()];
        match self {
            Request::ReadBits { start, count, .. } | Request::ReadWords { start, count, .. } => {
                adu.extend_from_slice(&start.to_be_bytes());
                adu.extend_from_slice(&count.to_be_bytes());
            }
            Request::WriteCoil { address, value } => {
                adu.extend_from_slice(&address.to_be_bytes());
                adu.extend_from_slice(if *value { &[0xFF, 0x00] } else { &[0x00, 0x00] });
            }
            Request::WriteRegister { address, value } => {
                adu.extend_from_slice(&address.to_be_bytes());
                adu.extend_from_slice(&value.to_be_bytes());
            }
            Request::WriteRegisters { start, values } => {
                adu.extend_from_slice(&start.to_be_bytes());
                adu.extend_from_slice(&(values.len() as u16).to_be_bytes());
                adu.push((values.len() * 2) as u8);
                for v in values {
                    adu.extend_from_slice(&v.to_be_bytes());
                }
            }
        }
        let crc = crc16(&adu);
        adu.extend_from_slice(&crc.to_le_bytes());
        adu
    }

    /// Length of a normal (non-exception) response ADU
    pub fn response_len(&self) -> usize {
        match self {
            Request::ReadBits { count, .. } => 5 + (*count as usize).div_ceil(8),
            Request::ReadWords { count, .. } => 5 + *count as usize * 2,
            Request::WriteCoil { .. } | Request::WriteRegister { .. } | Request::WriteRegisters { .. } => 8,
        }
    }
}

/// Decoded response body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Bits(Vec<bool>),
    Words(Vec<u16>),
    Written,
}

/// Number of bytes still needed before `partial` is a complete response
pub fn remaining(request: &Request, partial: &[u8]) -> usize {
    let expected = if partial.len() >= 2 && partial[1] & EXCEPTION_FLAG != 0 {
        EXCEPTION_LEN
    } else {
        request.response_len()
    };
    expected.saturating_sub(partial.len())
}

fn exception_text(code: u8) -> &'static str {
    match code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "slave device failure",
        0x05 => "acknowledge",
        0x06 => "slave device busy",
        0x08 => "memory parity error",
        0x0A => "gateway path unavailable",
        0x0B => "gateway target failed to respond",
        _ => "unknown exception",
    }
}

/// Validate and decode a complete response ADU
pub fn decode_response(slave: u8, request: &Request, adu: &[u8]) -> Result<Response> {
    if adu.len() < EXCEPTION_LEN {
        return Err(RadapterError::Framing(format!(
            "short Modbus response ({} bytes)",
            adu.len()
        )));
    }
    let (body, crc_bytes) = adu.split_at(adu.len() - 2);
    let received = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    let computed = crc16(body);
    if received != computed {
        return Err(RadapterError::Framing(format!(
            "Modbus CRC mismatch: got {:04X}, expected {:04X}",
            received, computed
        )));
    }
    if body[0] != slave {
        return Err(RadapterError::Framing(format!(
            "response from slave {} while waiting for {}",
            body[0], slave
        )));
    }
    let function = body[1];
    if function == request.function() | EXCEPTION_FLAG {
        let code = body[2];
        return Err(RadapterError::Modbus(format!(
            "slave {} rejected function 0x{:02X}: {} (0x{:02X})",
            slave,
            request.function(),
            exception_text(code),
            code
        )));
    }
    if function != request.function() {
        return Err(RadapterError::Framing(format!(
            "unexpected function 0x{:02X} in response to 0x{:02X}",
            function,
            request.function()
        )));
    }

    match request {
        Request::ReadBits { count, .. } => {
            let data = data_section(body, (*count as usize).div_ceil(8))?;
            let bits = (0..*count as usize)
                .map(|i| data[i / 8] & (1 << (i % 8)) != 0)
                .collect();
            Ok(Response::Bits(bits))
        }
        Request::ReadWords { count, .. } => {
            let data = data_section(body, *count as usize * 2)?;
            let words = data
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect();
            Ok(Response::Words(words))
        }
        _ => {
            let echoed = &body[2..];
            let sent = request.encode(slave);
            if echoed.len() != 4 || echoed != &sent[2..6] {
                return Err(RadapterError::Framing(
                    "write response does not echo the request".to_string(),
                ));
            }
            Ok(Response::Written)
        }
    }
}

fn data_section(body: &[u8], expected: usize) -> Result<&[u8]> {
    let byte_count = body[2] as usize;
    let data = &body[3..];
    if byte_count != expected || data.len() != expected {
        return Err(RadapterError::Framing(format!(
            "byte count {} does not match expected {}",
            byte_count, expected
        )));
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_crc(mut body: Vec<u8>) -> Vec<u8> {
        let crc = crc16(&body);
        body.extend_from_slice(&crc.to_le_bytes());
        body
    }

    #[test]
    fn test_crc_reference_vector() {
        let adu = Request::ReadWords {
            function: READ_HOLDING_REGISTERS,
            start: 0,
            count: 10,
        }
        .encode(1);
        assert_eq!(adu, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD]);
    }

    #[test]
    fn test_decode_words() {
        let request = Request::ReadWords {
            function: READ_HOLDING_REGISTERS,
            start: 0,
            count: 2,
        };
        let adu = with_crc(vec![0x01, 0x03, 0x04, 0x00, 0x2A, 0x12, 0x34]);
        assert_eq!(remaining(&request, &adu), 0);
        assert_eq!(
            decode_response(1, &request, &adu).unwrap(),
            Response::Words(vec![42, 0x1234])
        );
    }

    #[test]
    fn test_decode_bits() {
        let request = Request::ReadBits {
            function: READ_COILS,
            start: 0,
            count: 10,
        };
        let adu = with_crc(vec![0x01, 0x01, 0x02, 0b0000_0101, 0b0000_0010]);
        let Response::Bits(bits) = decode_response(1, &request, &adu).unwrap() else {
            panic!("expected bits");
        };
        assert_eq!(bits.len(), 10);
        assert!(bits[0] && !bits[1] && bits[2]);
        assert!(bits[9] && !bits[8]);
    }

    #[test]
    fn test_exception_response() {
        let request = Request::ReadWords {
            function: READ_HOLDING_REGISTERS,
            start: 100,
            count: 1,
        };
        let adu = with_crc(vec![0x01, 0x83, 0x02]);
        assert_eq!(remaining(&request, &adu[..2]), 3);
        let err = decode_response(1, &request, &adu).unwrap_err();
        assert!(matches!(err, RadapterError::Modbus(ref m) if m.contains("illegal data address")));
    }

    #[test]
    fn test_crc_mismatch_is_framing_error() {
        let request = Request::ReadWords {
            function: READ_HOLDING_REGISTERS,
            start: 0,
            count: 1,
        };
        let mut adu = with_crc(vec![0x01, 0x03, 0x02, 0x00, 0x01]);
        adu[3] ^= 0xFF;
        assert!(matches!(
            decode_response(1, &request, &adu),
            Err(RadapterError::Framing(_))
        ));
    }

    #[test]
    fn test_write_echo() {
        let request = Request::WriteRegisters {
            start: 10,
            values: vec![1, 2],
        };
        let encoded = request.encode(3);
        assert_eq!(&encoded[..7], &[0x03, 0x10, 0x00, 0x0A, 0x00, 0x02, 0x04]);
        let reply = with_crc(vec![0x03, 0x10, 0x00, 0x0A, 0x00, 0x02]);
        assert_eq!(decode_response(3, &request, &reply).unwrap(), Response::Written);

        let coil = Request::WriteCoil {
            address: 5,
            value: true,
        };
        let reply = coil.encode(3);
        assert_eq!(decode_response(3, &coil, &reply).unwrap(), Response::Written);
    }
}
