//! Register maps, read planning and value packing
//!
//! Registers are keyed by payload path. Adjacent readable registers of the
//! same table are grouped into one request so a poll cycle costs as few
//! round trips as possible.

use super::frame::{
    Request, MAX_READ_BITS, MAX_READ_REGISTERS, READ_COILS, READ_DISCRETE_INPUTS,
    READ_HOLDING_REGISTERS, READ_INPUT_REGISTERS,
};
use crate::config::{AccessMode, Endianness, RegisterConfig, RegisterMapConfig, RegisterType};
use crate::error::{RadapterError, Result};
use crate::message::path::SEPARATOR;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Unused addresses tolerated inside one merged read
pub const DEFAULT_GAP_THRESHOLD: u16 = 8;

/// Modbus data table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Coils,
    DiscreteInputs,
    Holding,
    Input,
}

impl Table {
    pub fn is_bit(self) -> bool {
        matches!(self, Table::Coils | Table::DiscreteInputs)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, Table::Coils | Table::Holding)
    }

    fn read_function(self) -> u8 {
        match self {
            Table::Coils => READ_COILS,
            Table::DiscreteInputs => READ_DISCRETE_INPUTS,
            Table::Holding => READ_HOLDING_REGISTERS,
            Table::Input => READ_INPUT_REGISTERS,
        }
    }

    fn max_read(self) -> u16 {
        if self.is_bit() {
            MAX_READ_BITS
        } else {
            MAX_READ_REGISTERS
        }
    }

    fn name(self) -> &'static str {
        match self {
            Table::Coils => "coils",
            Table::DiscreteInputs => "discrete_inputs",
            Table::Holding => "holding",
            Table::Input => "input",
        }
    }
}

/// One configured register
#[derive(Debug, Clone, PartialEq)]
pub struct Register {
    pub path: String,
    pub table: Table,
    pub config: RegisterConfig,
}

impl Register {
    /// Number of 16-bit registers (or bits) occupied
    pub fn width(&self) -> u16 {
        match self.config.kind {
            RegisterType::U32 | RegisterType::I32 | RegisterType::F32 => 2,
            RegisterType::U16 | RegisterType::I16 | RegisterType::Bit => 1,
        }
    }

    fn end(&self) -> u32 {
        self.config.index as u32 + self.width() as u32
    }

    /// Interpret raw words as a JSON value
    pub fn decode(&self, words: &[u16]) -> Value {
        let swap = |w: u16| match self.config.byte_order {
            Endianness::Big => w,
            Endianness::Little => w.swap_bytes(),
        };
        let wide = || -> u32 {
            let (hi, lo) = match self.config.word_order {
                Endianness::Big => (words[0], words[1]),
                Endianness::Little => (words[1], words[0]),
            };
            ((swap(hi) as u32) << 16) | swap(lo) as u32
        };
        match self.config.kind {
            RegisterType::Bit => Value::Bool(words[0] != 0),
            RegisterType::U16 => Value::from(swap(words[0])),
            RegisterType::I16 => Value::from(swap(words[0]) as i16),
            RegisterType::U32 => Value::from(wide()),
            RegisterType::I32 => Value::from(wide() as i32),
            RegisterType::F32 => {
                let f = f32::from_bits(wide()) as f64;
                serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number)
            }
        }
    }

    /// Pack a JSON value into raw words
    pub fn encode(&self, value: &Value) -> Result<Vec<u16>> {
        let invalid = || {
            RadapterError::Modbus(format!(
                "value {} does not fit register '{}' ({:?})",
                value, self.path, self.config.kind
            ))
        };
        let swap = |w: u16| match self.config.byte_order {
            Endianness::Big => w,
            Endianness::Little => w.swap_bytes(),
        };
        let split = |raw: u32| {
            let (hi, lo) = (swap((raw >> 16) as u16), swap(raw as u16));
            match self.config.word_order {
                Endianness::Big => vec![hi, lo],
                Endianness::Little => vec![lo, hi],
            }
        };
        let integer = || -> Option<i64> {
            value
                .as_i64()
                .or_else(|| value.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                .or_else(|| value.as_bool().map(i64::from))
        };
        match self.config.kind {
            RegisterType::Bit => {
                let on = value
                    .as_bool()
                    .or_else(|| value.as_f64().map(|f| f != 0.0))
                    .ok_or_else(invalid)?;
                Ok(vec![on as u16])
            }
            RegisterType::U16 => {
                let v = integer().and_then(|i| u16::try_from(i).ok()).ok_or_else(invalid)?;
                Ok(vec![swap(v)])
            }
            RegisterType::I16 => {
                let v = integer().and_then(|i| i16::try_from(i).ok()).ok_or_else(invalid)?;
                Ok(vec![swap(v as u16)])
            }
            RegisterType::U32 => {
                let v = integer().and_then(|i| u32::try_from(i).ok()).ok_or_else(invalid)?;
                Ok(split(v))
            }
            RegisterType::I32 => {
                let v = integer().and_then(|i| i32::try_from(i).ok()).ok_or_else(invalid)?;
                Ok(split(v as u32))
            }
            RegisterType::F32 => {
                let f = value.as_f64().filter(|f| f.is_finite()).ok_or_else(invalid)?;
                Ok(split((f as f32).to_bits()))
            }
        }
    }
}

/// A merged read covering one or more registers
#[derive(Debug, Clone, PartialEq)]
pub struct ReadBlock {
    pub table: Table,
    pub start: u16,
    pub count: u16,
    /// Indices into [`RegisterMap::registers`]
    pub members: Vec<usize>,
}

impl ReadBlock {
    pub fn request(&self) -> Request {
        if self.table.is_bit() {
            Request::ReadBits {
                function: self.table.read_function(),
                start: self.start,
                count: self.count,
            }
        } else {
            Request::ReadWords {
                function: self.table.read_function(),
                start: self.start,
                count: self.count,
            }
        }
    }
}

/// Validated set of registers
#[derive(Debug, Clone, Default)]
pub struct RegisterMap {
    registers: Vec<Register>,
    by_path: HashMap<String, usize>,
}

impl RegisterMap {
    pub fn from_config(config: &RegisterMapConfig) -> Result<Self> {
        let tables: [(Table, &BTreeMap<String, RegisterConfig>); 4] = [
            (Table::Coils, &config.coils),
            (Table::DiscreteInputs, &config.discrete_inputs),
            (Table::Holding, &config.holding),
            (Table::Input, &config.input),
        ];

        let mut map = RegisterMap::default();
        for (table, entries) in tables {
            for (path, reg) in entries {
                map.push(table, path, reg)?;
            }
        }

        for table in [Table::Coils, Table::DiscreteInputs, Table::Holding, Table::Input] {
            let mut spans: Vec<&Register> = map.registers.iter().filter(|r| r.table == table).collect();
            spans.sort_by_key(|r| r.config.index);
            for pair in spans.windows(2) {
                if (pair[1].config.index as u32) < pair[0].end() {
                    return Err(RadapterError::Config(format!(
                        "registers '{}' and '{}' overlap in {}",
                        pair[0].path,
                        pair[1].path,
                        table.name()
                    )));
                }
            }
        }
        Ok(map)
    }

    fn push(&mut self, table: Table, path: &str, config: &RegisterConfig) -> Result<()> {
        let reject = |reason: String| {
            RadapterError::Config(format!("register '{}' in {}: {}", path, table.name(), reason))
        };
        if path.is_empty() || path.split(SEPARATOR).any(str::is_empty) {
            return Err(reject("invalid path".to_string()));
        }
        if self.by_path.contains_key(path) {
            return Err(reject("path defined twice".to_string()));
        }
        let mut config = config.clone();
        if table.is_bit() {
            match config.kind {
                RegisterType::Bit | RegisterType::U16 => config.kind = RegisterType::Bit,
                other => return Err(reject(format!("bit table cannot hold {:?}", other))),
            }
        } else if config.kind == RegisterType::Bit {
            return Err(reject("bit type only allowed in coils or discrete_inputs".to_string()));
        }
        if config.mode.writable() && !table.is_writable() {
            return Err(reject("table is read-only".to_string()));
        }
        let register = Register {
            path: path.to_string(),
            table,
            config,
        };
        if register.end() > u16::MAX as u32 + 1 {
            return Err(reject("address out of range".to_string()));
        }
        self.by_path.insert(register.path.clone(), self.registers.len());
        self.registers.push(register);
        Ok(())
    }

    pub fn registers(&self) -> &[Register] {
        &self.registers
    }

    pub fn get(&self, path: &str) -> Option<&Register> {
        self.by_path.get(path).map(|&i| &self.registers[i])
    }

    pub fn len(&self) -> usize {
        self.registers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registers.is_empty()
    }

    /// Group readable registers into as few requests as possible
    pub fn plan_reads(&self, gap_threshold: u16) -> Vec<ReadBlock> {
        let mut readable: Vec<(usize, &Register)> = self
            .registers
            .iter()
            .enumerate()
            .filter(|(_, r)| r.config.mode != AccessMode::Write)
            .collect();
        readable.sort_by_key(|(_, r)| (r.table, r.config.index));

        let mut blocks: Vec<ReadBlock> = Vec::new();
        for (i, reg) in readable {
            if let Some(block) = blocks.last_mut() {
                let block_end = block.start as u32 + block.count as u32;
                let merged_end = block_end.max(reg.end());
                if block.table == reg.table
                    && reg.config.index as u32 <= block_end + gap_threshold as u32
                    && merged_end - block.start as u32 <= reg.table.max_read() as u32
                {
                    block.count = (merged_end - block.start as u32) as u16;
                    block.members.push(i);
                    continue;
                }
            }
            blocks.push(ReadBlock {
                table: reg.table,
                start: reg.config.index,
                count: reg.width(),
                members: vec![i],
            });
        }
        blocks
    }

    /// Extract member values from the words (or bits as 0/1) of a block
    pub fn extract(&self, block: &ReadBlock, data: &[u16]) -> Vec<(String, Value)> {
        block
            .members
            .iter()
            .filter_map(|&i| {
                let reg = &self.registers[i];
                let offset = (reg.config.index - block.start) as usize;
                let words = data.get(offset..offset + reg.width() as usize)?;
                Some((reg.path.clone(), reg.decode(words)))
            })
            .collect()
    }
}
