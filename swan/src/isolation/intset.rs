// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::iter::FromIterator;
use std::str::FromStr;

/// Ordered set of CPU or memory node ids.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntSet(BTreeSet<u32>);

impl IntSet {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.0.contains(&id)
    }

    pub fn insert(&mut self, id: u32) -> bool {
        self.0.insert(id)
    }

    pub fn remove(&mut self, id: u32) -> bool {
        self.0.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter().cloned()
    }

    pub fn union(&self, other: &Self) -> Self {
        Self(self.0.union(&other.0).cloned().collect())
    }

    pub fn intersection(&self, other: &Self) -> Self {
        Self(self.0.intersection(&other.0).cloned().collect())
    }

    pub fn difference(&self, other: &Self) -> Self {
        Self(self.0.difference(&other.0).cloned().collect())
    }

    pub fn is_subset(&self, other: &Self) -> bool {
        self.0.is_subset(&other.0)
    }

    /// The `nr` lowest ids.
    pub fn take(&self, nr: usize) -> Result<Self> {
        if nr > self.len() {
            bail!(
                "cannot take {} elements from a set of size {}",
                nr,
                self.len()
            );
        }
        Ok(Self(self.0.iter().take(nr).cloned().collect()))
    }

    /// Comma separated ids, e.g. `0,1,2,5`.
    pub fn to_list_string(&self) -> String {
        self.iter()
            .map(|id| id.to_string())
            .collect::<Vec<String>>()
            .join(",")
    }
}

impl FromIterator<u32> for IntSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Range notation, e.g. `0-2,5`.
impl fmt::Display for IntSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut ranges: Vec<(u32, u32)> = vec![];
        for id in self.iter() {
            match ranges.last_mut() {
                Some(last) if last.1 + 1 == id => last.1 = id,
                _ => ranges.push((id, id)),
            }
        }
        let strs: Vec<String> = ranges
            .iter()
            .map(|(lo, hi)| {
                if lo == hi {
                    lo.to_string()
                } else {
                    format!("{}-{}", lo, hi)
                }
            })
            .collect();
        write!(f, "{}", strs.join(","))
    }
}

impl FromStr for IntSet {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> Result<Self> {
        let mut set = IntSet::new();
        for tok in input.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
            let parse = |s: &str| {
                s.trim()
                    .parse::<u32>()
                    .map_err(|e| anyhow!("invalid id {:?} in {:?} ({})", s, input, e))
            };
            match tok.find('-') {
                Some(idx) => {
                    let lo = parse(&tok[..idx])?;
                    let hi = parse(&tok[idx + 1..])?;
                    if lo > hi {
                        bail!("invalid range {:?} in {:?}", tok, input);
                    }
                    for id in lo..=hi {
                        set.insert(id);
                    }
                }
                None => {
                    set.insert(parse(tok)?);
                }
            }
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_format() {
        for pair in &[
            ("", ""),
            ("0", "0"),
            ("0-2,5", "0-2,5"),
            ("5,0,1,2", "0-2,5"),
            ("1-1,3-4, 8", "1,3-4,8"),
        ] {
            let set: IntSet = pair.0.parse().unwrap();
            assert_eq!(set.to_string(), pair.1);
        }
        assert!("3-1".parse::<IntSet>().is_err());
        assert!("a,b".parse::<IntSet>().is_err());
    }

    #[test]
    fn test_set_ops() {
        let a: IntSet = "0-3".parse().unwrap();
        let b: IntSet = "2-5".parse().unwrap();
        assert_eq!(a.union(&b).to_string(), "0-5");
        assert_eq!(a.intersection(&b).to_string(), "2-3");
        assert_eq!(a.difference(&b).to_string(), "0-1");
        assert_eq!(a.take(2).unwrap().to_list_string(), "0,1");
        assert!(a.take(5).is_err());
        assert!(a.take(2).unwrap().is_subset(&a));
    }
}
