//! GTID (Global Transaction ID) 집합
//!
//! GTID 형식: UUID:sequence-number
//! 집합 텍스트 형식: "uuid1:1-100:200,uuid2:1-50"
//! 덤프 엔진은 이 집합을 "이미 적용된 트랜잭션" 제외 목록으로 사용합니다.

use crate::error::{CdcError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{Cursor, Read, Write};
use std::str::FromStr;
use uuid::Uuid;

/// GTID 범위 (양 끝 포함)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GtidRange {
    pub start: u64,
    pub end: u64,
}

impl GtidRange {
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start == 0 || start > end {
            return Err(CdcError::GtidError(format!(
                "Invalid range: {}-{}",
                start, end
            )));
        }
        Ok(GtidRange { start, end })
    }

    pub fn contains(&self, value: u64) -> bool {
        value >= self.start && value <= self.end
    }

    pub fn covers(&self, other: &GtidRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn merge(&self, other: &GtidRange) -> Option<GtidRange> {
        // 겹치거나 연접한 범위 병합
        if self.end.saturating_add(1) >= other.start && other.end.saturating_add(1) >= self.start {
            Some(GtidRange {
                start: self.start.min(other.start),
                end: self.end.max(other.end),
            })
        } else {
            None
        }
    }
}

/// UUID 하나의 GTID 범위들 (정렬, 병합된 상태 유지)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UUIDGtidSet {
    pub ranges: Vec<GtidRange>,
}

impl UUIDGtidSet {
    pub fn add_range(&mut self, range: GtidRange) {
        self.ranges.push(range);
        self.ranges.sort();

        let mut merged: Vec<GtidRange> = Vec::with_capacity(self.ranges.len());
        for range in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(last) => match last.merge(&range) {
                    Some(m) => *last = m,
                    None => merged.push(range),
                },
                None => merged.push(range),
            }
        }
        self.ranges = merged;
    }

    pub fn contains(&self, sequence: u64) -> bool {
        self.ranges.iter().any(|r| r.contains(sequence))
    }

    fn covers(&self, range: &GtidRange) -> bool {
        self.ranges.iter().any(|r| r.covers(range))
    }

    /// 가장 큰 적용 번호
    pub fn max_sequence(&self) -> Option<u64> {
        self.ranges.last().map(|r| r.end)
    }
}

/// 전체 GTID 집합 (여러 UUID)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GtidSet {
    pub sets: BTreeMap<Uuid, UUIDGtidSet>,
}

impl GtidSet {
    pub fn new() -> Self {
        GtidSet {
            sets: BTreeMap::new(),
        }
    }

    /// GTID 집합 문자열 파싱 (format: "uuid1:1-100:200,uuid2:1-50")
    pub fn parse(gtid_str: &str) -> Result<Self> {
        let mut gtid_set = GtidSet::new();

        let gtid_str = gtid_str.trim();
        if gtid_str.is_empty() || gtid_str == "NULL" {
            return Ok(gtid_set);
        }

        for entry in gtid_str.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }

            let mut parts = entry.split(':');
            let uuid_str = parts.next().unwrap_or_default().trim();
            let sid = Uuid::parse_str(uuid_str)
                .map_err(|e| CdcError::GtidError(format!("Invalid UUID '{}': {}", uuid_str, e)))?;

            let mut has_interval = false;
            for range_part in parts {
                let range_part = range_part.trim();
                let range = match range_part.split_once('-') {
                    Some((start, end)) => GtidRange::new(
                        parse_sequence(start, range_part)?,
                        parse_sequence(end, range_part)?,
                    )?,
                    None => {
                        let seq = parse_sequence(range_part, range_part)?;
                        GtidRange::new(seq, seq)?
                    }
                };
                gtid_set.add_range(sid, range);
                has_interval = true;
            }

            if !has_interval {
                return Err(CdcError::GtidError(format!(
                    "GTID entry without interval: {}",
                    entry
                )));
            }
        }

        Ok(gtid_set)
    }

    pub fn add(&mut self, sid: Uuid, sequence: u64) -> Result<()> {
        let range = GtidRange::new(sequence, sequence)?;
        self.add_range(sid, range);
        Ok(())
    }

    pub fn add_range(&mut self, sid: Uuid, range: GtidRange) {
        self.sets.entry(sid).or_default().add_range(range);
    }

    /// "uuid:sequence" 형식의 단일 GTID 추가
    pub fn add_gtid(&mut self, gtid: &str) -> Result<()> {
        let (sid, sequence) = parse_single_gtid(gtid)?;
        self.add(sid, sequence)
    }

    pub fn contains(&self, sid: &Uuid, sequence: u64) -> bool {
        self.sets
            .get(sid)
            .map(|set| set.contains(sequence))
            .unwrap_or(false)
    }

    pub fn contains_gtid(&self, gtid: &str) -> bool {
        match parse_single_gtid(gtid) {
            Ok((sid, sequence)) => self.contains(&sid, sequence),
            Err(_) => false,
        }
    }

    pub fn union(&mut self, other: &GtidSet) {
        for (sid, other_set) in &other.sets {
            for range in &other_set.ranges {
                self.add_range(*sid, *range);
            }
        }
    }

    /// self 의 모든 GTID 가 other 에 포함되는지
    pub fn is_subset_of(&self, other: &GtidSet) -> bool {
        self.sets.iter().all(|(sid, set)| {
            set.ranges.is_empty()
                || other
                    .sets
                    .get(sid)
                    .map(|other_set| set.ranges.iter().all(|r| other_set.covers(r)))
                    .unwrap_or(false)
        })
    }

    pub fn subtract(&self, other: &GtidSet) -> GtidSet {
        let mut result = self.clone();

        for (sid, other_set) in &other.sets {
            if let Some(result_set) = result.sets.get_mut(sid) {
                // 각 범위를 빼기
                for other_range in &other_set.ranges {
                    let mut new_ranges = Vec::new();
                    for range in &result_set.ranges {
                        if range.end < other_range.start || range.start > other_range.end {
                            // 겹치지 않음
                            new_ranges.push(*range);
                        } else {
                            // 겹침 - 부분 제거
                            if range.start < other_range.start {
                                new_ranges.push(GtidRange {
                                    start: range.start,
                                    end: other_range.start - 1,
                                });
                            }
                            if range.end > other_range.end {
                                new_ranges.push(GtidRange {
                                    start: other_range.end + 1,
                                    end: range.end,
                                });
                            }
                        }
                    }
                    result_set.ranges = new_ranges;
                }
            }
        }

        result.sets.retain(|_, set| !set.ranges.is_empty());
        result
    }

    /// UUID 별 가장 큰 적용 트랜잭션 번호
    pub fn highest_applied(&self) -> BTreeMap<Uuid, u64> {
        self.sets
            .iter()
            .filter_map(|(sid, set)| set.max_sequence().map(|max| (*sid, max)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.values().all(|set| set.ranges.is_empty())
    }

    /// MySQL 바이너리 SID 블록 인코딩 (COM_BINLOG_DUMP_GTID, PREVIOUS_GTIDS)
    ///
    /// n_sids(8) { sid(16) n_intervals(8) { start(8) end_exclusive(8) }* }*
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        let non_empty: Vec<_> = self
            .sets
            .iter()
            .filter(|(_, set)| !set.ranges.is_empty())
            .collect();

        buffer.write_u64::<LittleEndian>(non_empty.len() as u64)?;
        for (sid, set) in non_empty {
            buffer.write_all(sid.as_bytes())?;
            buffer.write_u64::<LittleEndian>(set.ranges.len() as u64)?;
            for range in &set.ranges {
                buffer.write_u64::<LittleEndian>(range.start)?;
                buffer.write_u64::<LittleEndian>(range.end + 1)?;
            }
        }
        Ok(buffer)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut gtid_set = GtidSet::new();
        if data.is_empty() {
            return Ok(gtid_set);
        }

        let mut cursor = Cursor::new(data);
        let n_sids = cursor.read_u64::<LittleEndian>()?;
        for _ in 0..n_sids {
            let mut sid_bytes = [0u8; 16];
            cursor.read_exact(&mut sid_bytes)?;
            let sid = Uuid::from_bytes(sid_bytes);

            let n_intervals = cursor.read_u64::<LittleEndian>()?;
            for _ in 0..n_intervals {
                let start = cursor.read_u64::<LittleEndian>()?;
                let end_exclusive = cursor.read_u64::<LittleEndian>()?;
                if end_exclusive <= start {
                    return Err(CdcError::GtidError(format!(
                        "Invalid encoded interval: {}-{}",
                        start, end_exclusive
                    )));
                }
                gtid_set.add_range(sid, GtidRange::new(start, end_exclusive - 1)?);
            }
        }

        Ok(gtid_set)
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (sid, set) in &self.sets {
            if set.ranges.is_empty() {
                continue;
            }
            if !first {
                write!(f, ",")?;
            }
            first = false;
            write!(f, "{}", sid)?;
            for r in &set.ranges {
                if r.start == r.end {
                    write!(f, ":{}", r.start)?;
                } else {
                    write!(f, ":{}-{}", r.start, r.end)?;
                }
            }
        }
        Ok(())
    }
}

impl FromStr for GtidSet {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        GtidSet::parse(s)
    }
}

impl Serialize for GtidSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GtidSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        GtidSet::parse(&text).map_err(serde::de::Error::custom)
    }
}

fn parse_sequence(value: &str, context: &str) -> Result<u64> {
    value
        .trim()
        .parse::<u64>()
        .map_err(|_| CdcError::GtidError(format!("Invalid sequence: {}", context)))
}

fn parse_single_gtid(gtid: &str) -> Result<(Uuid, u64)> {
    let (uuid, sequence) = gtid
        .split_once(':')
        .ok_or_else(|| CdcError::GtidError(format!("Invalid GTID format: {}", gtid)))?;
    let sid = Uuid::parse_str(uuid.trim())
        .map_err(|e| CdcError::GtidError(format!("Invalid UUID '{}': {}", uuid, e)))?;
    Ok((sid, parse_sequence(sequence, gtid)?))
}
