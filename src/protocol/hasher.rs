use crate::address;
use crate::config;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Function {
    Simple,
    Xor { shift: u32 },
    Shift { shift: u32 },
    /// XOR of one row per set address bit above the initial shift.
    Matrix { rows: Vec<u32> },
}

/// Maps a block address to its directory buckets, one per hash function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketHasher {
    functions: Vec<(Function, u32)>,
    shift: u32,
    mask: u64,
}

fn invalid(function: &str, reason: &str) -> config::Error {
    config::Error::Invalid(format!("hash function {function:?}: {reason}"))
}

fn parse_shift(function: &str, value: Option<&str>) -> Result<u32, config::Error> {
    value
        .and_then(|v| v.trim().parse().ok())
        .filter(|shift| *shift < 64)
        .ok_or_else(|| invalid(function, "expected a shift amount below 64"))
}

impl BucketHasher {
    pub fn new(config: &config::Hasher) -> Result<Self, config::Error> {
        if !config.buckets_per_hash.is_power_of_two() {
            return Err(config::Error::Invalid(format!(
                "buckets per hash {} is not a power of two",
                config.buckets_per_hash
            )));
        }
        if config.functions.is_empty() {
            return Err(config::Error::Invalid(
                "a directory needs at least one hash function".to_string(),
            ));
        }
        let stride = if config.partitioned {
            config.buckets_per_hash
        } else {
            0
        };
        let mut functions = Vec::with_capacity(config.functions.len());
        for (i, spec) in config.functions.iter().enumerate() {
            let (name, arg) = match spec.split_once(':') {
                Some((name, arg)) => (name, Some(arg)),
                None => (spec.as_str(), None),
            };
            let function = match name.to_ascii_lowercase().as_str() {
                "simple" => Function::Simple,
                "xor" => Function::Xor {
                    shift: parse_shift(spec, arg)?,
                },
                "shift" => Function::Shift {
                    shift: parse_shift(spec, arg)?,
                },
                "matrix" => Function::Matrix {
                    rows: Self::matrix_rows(spec, arg, config)?,
                },
                _ => return Err(invalid(spec, "unknown hash function")),
            };
            let first_bucket = stride * i as u32;
            functions.push((function, first_bucket));
        }
        Ok(Self {
            functions,
            shift: config.initial_shift,
            mask: u64::from(config.buckets_per_hash - 1),
        })
    }

    /// Rows are given as `list:<a>,<b>,...` or drawn from `random:<seed>`.
    fn matrix_rows(
        spec: &str,
        arg: Option<&str>,
        config: &config::Hasher,
    ) -> Result<Vec<u32>, config::Error> {
        let arg = arg.ok_or_else(|| invalid(spec, "missing matrix rows"))?;
        match arg.split_once(':') {
            Some(("list", rows)) => rows
                .split(',')
                .map(|row| row.trim().parse::<u32>())
                .collect::<Result<_, _>>()
                .map_err(|_| invalid(spec, "malformed row list")),
            Some(("random", seed)) => {
                let seed: u64 = seed
                    .trim()
                    .parse()
                    .map_err(|_| invalid(spec, "malformed seed"))?;
                let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
                let bits = 32u32.saturating_sub(config.initial_shift);
                Ok((0..bits)
                    .map(|_| rng.gen_range(0..config.buckets_per_hash))
                    .collect())
            }
            _ => Err(invalid(spec, "expected list:<rows> or random:<seed>")),
        }
    }

    #[must_use]
    pub fn num_functions(&self) -> usize {
        self.functions.len()
    }

    fn hash(&self, function: &Function, first_bucket: u32, addr: address) -> u32 {
        let bucket = match function {
            Function::Simple => addr >> self.shift,
            Function::Xor { shift } => (addr >> self.shift) ^ (addr >> shift),
            Function::Shift { shift } => addr >> (self.shift + shift),
            Function::Matrix { rows } => {
                let mut bits = addr >> self.shift;
                let mut bucket = 0u64;
                for row in rows {
                    if bits & 1 != 0 {
                        bucket ^= u64::from(*row);
                    }
                    bits >>= 1;
                }
                bucket
            }
        };
        (bucket & self.mask) as u32 + first_bucket
    }

    /// Buckets of a block address.
    #[must_use]
    pub fn buckets(&self, addr: address) -> BTreeSet<u32> {
        self.functions
            .iter()
            .map(|(function, first)| self.hash(function, *first, addr))
            .collect()
    }

    /// Buckets of `addr` that none of `others` hashes to.
    #[must_use]
    pub fn conflict_free(
        &self,
        addr: address,
        others: impl IntoIterator<Item = address>,
    ) -> BTreeSet<u32> {
        let mut buckets = self.buckets(addr);
        for other in others {
            for bucket in self.buckets(other) {
                buckets.remove(&bucket);
            }
        }
        buckets
    }
}
