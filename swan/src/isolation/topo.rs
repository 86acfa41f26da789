// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Context, Result};
use std::collections::BTreeSet;
use std::process::Command;

use super::IntSet;
use swan_util::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Thread {
    pub id: u32,
    pub core: u32,
    pub socket: u32,
}

/// Logical CPUs of the host in `lscpu -p` order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ThreadSet(pub Vec<Thread>);

impl ThreadSet {
    /// Parses `lscpu -p` output. Only the leading cpu, core and socket
    /// columns are used.
    pub fn parse_lscpu(output: &str) -> Result<Self> {
        let mut threads = vec![];
        for line in output.trim().lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let cols: Vec<&str> = line.split(',').collect();
            if cols.len() < 3 {
                bail!("expected cpu,core,socket in {:?}", line);
            }
            let parse = |idx: usize| {
                cols[idx]
                    .trim()
                    .parse::<u32>()
                    .with_context(|| format!("parsing column {} of {:?}", idx, line))
            };
            threads.push(Thread {
                id: parse(0)?,
                core: parse(1)?,
                socket: parse(2)?,
            });
        }
        Ok(Self(threads))
    }

    pub fn discover() -> Result<Self> {
        let output = command_output(Command::new("lscpu").arg("-p"))
            .context("could not execute \"lscpu -p\"")?;
        Self::parse_lscpu(&output)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn filter<F: Fn(&Thread) -> bool>(&self, pred: F) -> Self {
        Self(self.0.iter().filter(|t| pred(t)).cloned().collect())
    }

    pub fn contains(&self, thread: &Thread) -> bool {
        self.0.contains(thread)
    }

    pub fn available_threads(&self) -> IntSet {
        self.0.iter().map(|t| t.id).collect()
    }

    pub fn available_cores(&self) -> IntSet {
        self.0.iter().map(|t| t.core).collect()
    }

    pub fn available_sockets(&self) -> IntSet {
        self.0.iter().map(|t| t.socket).collect()
    }

    pub fn from_threads(&self, ids: &IntSet) -> Result<Self> {
        let found = self.filter(|t| ids.contains(t.id));
        if found.len() != ids.len() {
            bail!(
                "threads {} not all present in topology ({})",
                ids,
                self.available_threads()
            );
        }
        Ok(found)
    }

    pub fn from_cores(&self, cores: &IntSet) -> Self {
        self.filter(|t| cores.contains(t.core))
    }

    /// All threads of the `nr` lowest numbered sockets.
    pub fn sockets(&self, nr: usize) -> Result<Self> {
        let sockets = self.available_sockets().take(nr)?;
        Ok(self.filter(|t| sockets.contains(t.socket)))
    }

    pub fn difference(&self, other: &Self) -> Self {
        self.filter(|t| !other.contains(t))
    }

    /// One thread per physical core of the first socket. These threads
    /// share the last level cache but no L1.
    pub fn shared_cache_threads(&self) -> Result<Self> {
        let socket = self.sockets(1)?;
        let mut seen = BTreeSet::new();
        let mut threads = vec![];
        for t in socket.0.iter() {
            if seen.insert(t.core) {
                threads.push(*t);
            }
        }
        Ok(Self(threads))
    }

    /// Hyperthread siblings of `threads` which are not in `threads`.
    pub fn siblings_of(&self, threads: &Self) -> Self {
        let mut siblings = vec![];
        for t in threads.0.iter() {
            for s in self.0.iter() {
                if s.core == t.core
                    && s.socket == t.socket
                    && s.id != t.id
                    && !threads.contains(s)
                    && !siblings.contains(s)
                {
                    siblings.push(*s);
                }
            }
        }
        Self(siblings)
    }
}

#[cfg(test)]
pub(crate) const LSCPU_2S_HT: &str = "\
# The following is the parsable format, which can be fed to other
# programs. Each different item in every column has an unique ID
# starting from zero.
# CPU,Core,Socket,Node,,L1d,L1i,L2,L3
0,0,0,0,,0,0,0,0
1,1,0,0,,1,1,1,0
2,2,0,0,,2,2,2,0
3,3,0,0,,3,3,3,0
4,4,1,1,,4,4,4,1
5,5,1,1,,5,5,5,1
6,0,0,0,,0,0,0,0
7,1,0,0,,1,1,1,0
8,2,0,0,,2,2,2,0
9,3,0,0,,3,3,3,0
10,4,1,1,,4,4,4,1
11,5,1,1,,5,5,5,1
";
