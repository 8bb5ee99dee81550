//! CPU bitmap with kernel cpulist syntax.
//!
//! The kernel exposes cpu sets as comma-separated ranges (`0-3,8,10-11`)
//! in sysfs and cpuset knobs; this type parses and formats that syntax and
//! provides the set algebra the cpu distribution pass needs.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ArborError, Result};

/// A set of cpu indices backed by 64-bit words.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuMask {
    words: Vec<u64>,
}

impl CpuMask {
    /// Creates an empty mask.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a mask from an iterator of cpu indices.
    #[must_use]
    pub fn from_cpus<I: IntoIterator<Item = u32>>(cpus: I) -> Self {
        let mut mask = Self::new();
        for cpu in cpus {
            mask.set(cpu);
        }
        mask
    }

    /// Tests a single cpu.
    #[must_use]
    pub fn get(&self, cpu: u32) -> bool {
        let word = (cpu / 64) as usize;
        self.words.get(word).is_some_and(|w| w & (1 << (cpu % 64)) != 0)
    }

    /// Adds a single cpu.
    pub fn set(&mut self, cpu: u32) {
        let word = (cpu / 64) as usize;
        if self.words.len() <= word {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (cpu % 64);
    }

    /// Removes a single cpu.
    pub fn clear(&mut self, cpu: u32) {
        let word = (cpu / 64) as usize;
        if let Some(w) = self.words.get_mut(word) {
            *w &= !(1 << (cpu % 64));
        }
    }

    /// Removes every cpu.
    pub fn clear_all(&mut self) {
        self.words.clear();
    }

    /// Adds every cpu of `other`.
    pub fn add(&mut self, other: &CpuMask) {
        if self.words.len() < other.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (dst, src) in self.words.iter_mut().zip(&other.words) {
            *dst |= src;
        }
    }

    /// Removes every cpu of `other`.
    pub fn remove(&mut self, other: &CpuMask) {
        for (dst, src) in self.words.iter_mut().zip(&other.words) {
            *dst &= !src;
        }
    }

    /// Number of cpus in the mask.
    #[must_use]
    pub fn weight(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    /// True when no cpu is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    /// True when every cpu of `self` is also in `other`.
    #[must_use]
    pub fn is_subset_of(&self, other: &CpuMask) -> bool {
        self.words
            .iter()
            .enumerate()
            .all(|(i, w)| w & !other.words.get(i).copied().unwrap_or(0) == 0)
    }

    /// True when the two masks share no cpu.
    #[must_use]
    pub fn is_disjoint(&self, other: &CpuMask) -> bool {
        self.words
            .iter()
            .zip(&other.words)
            .all(|(a, b)| a & b == 0)
    }

    /// Iterates set cpu indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.words.iter().enumerate().flat_map(|(wi, w)| {
            #[allow(clippy::cast_possible_truncation)]
            (0..64u32).filter_map(move |bit| {
                (w & (1 << bit) != 0).then_some(wi as u32 * 64 + bit)
            })
        })
    }

    /// Index one past the highest cpu ever set; iteration bound.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        let bits = self.words.len() as u32 * 64;
        bits
    }
}

impl fmt::Display for CpuMask {
    /// Formats as a kernel cpulist: `0-3,8`. Empty mask formats as `""`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut run: Option<(u32, u32)> = None;
        let flush = |f: &mut fmt::Formatter<'_>, run: (u32, u32), first: &mut bool| {
            if !*first {
                f.write_str(",")?;
            }
            *first = false;
            if run.0 == run.1 {
                write!(f, "{}", run.0)
            } else {
                write!(f, "{}-{}", run.0, run.1)
            }
        };
        for cpu in self.iter() {
            run = match run {
                Some((lo, hi)) if cpu == hi + 1 => Some((lo, cpu)),
                Some(done) => {
                    flush(f, done, &mut first)?;
                    Some((cpu, cpu))
                }
                None => Some((cpu, cpu)),
            };
        }
        if let Some(done) = run {
            flush(f, done, &mut first)?;
        }
        Ok(())
    }
}

impl FromStr for CpuMask {
    type Err = ArborError;

    /// Parses a kernel cpulist. The empty string is the empty mask.
    fn from_str(s: &str) -> Result<Self> {
        let mut mask = CpuMask::new();
        for part in s.trim().split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (lo, hi) = match part.split_once('-') {
                Some((lo, hi)) => (lo, hi),
                None => (part, part),
            };
            let lo: u32 = lo
                .parse()
                .map_err(|_| ArborError::invalid_value(format!("invalid cpu list: {s}")))?;
            let hi: u32 = hi
                .parse()
                .map_err(|_| ArborError::invalid_value(format!("invalid cpu list: {s}")))?;
            if hi < lo || hi >= 4096 {
                return Err(ArborError::invalid_value(format!("invalid cpu range: {part}")));
            }
            for cpu in lo..=hi {
                mask.set(cpu);
            }
        }
        Ok(mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_format_roundtrip() {
        for list in ["", "0", "0-3", "0-3,8", "0-1,4-5,63-65"] {
            let mask: CpuMask = list.parse().expect("parse");
            assert_eq!(mask.to_string(), list);
        }
    }

    #[test]
    fn weight_and_membership() {
        let mask: CpuMask = "0-3,8".parse().unwrap();
        assert_eq!(mask.weight(), 5);
        assert!(mask.get(8));
        assert!(!mask.get(4));
    }

    #[test]
    fn subset_and_disjoint() {
        let all: CpuMask = "0-7".parse().unwrap();
        let low: CpuMask = "0-3".parse().unwrap();
        let high: CpuMask = "4-7".parse().unwrap();
        assert!(low.is_subset_of(&all));
        assert!(!all.is_subset_of(&low));
        assert!(low.is_disjoint(&high));
        assert!(!low.is_disjoint(&all));
    }

    #[test]
    fn add_and_remove() {
        let mut mask: CpuMask = "0-3".parse().unwrap();
        let other: CpuMask = "2-5".parse().unwrap();
        mask.add(&other);
        assert_eq!(mask.to_string(), "0-5");
        mask.remove(&"0-1".parse().unwrap());
        assert_eq!(mask.to_string(), "2-5");
    }

    #[test]
    fn word_boundary_cpus() {
        let mut mask = CpuMask::new();
        mask.set(63);
        mask.set(64);
        assert_eq!(mask.to_string(), "63-64");
        assert_eq!(mask.weight(), 2);
    }

    #[test]
    fn rejects_garbage() {
        assert!("0-".parse::<CpuMask>().is_err());
        assert!("a-b".parse::<CpuMask>().is_err());
        assert!("3-1".parse::<CpuMask>().is_err());
    }
}
