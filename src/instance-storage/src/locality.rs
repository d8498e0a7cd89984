// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Locality tiers of a SQL instance, e.g. `region=us-east1,zone=us-east1-b`.

use std::fmt;
use std::str::FromStr;

/// One `key=value` level of a [`Locality`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tier {
    pub key: String,
    pub value: String,
}

/// An ordered list of locality tiers, from the broadest to the narrowest.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct Locality {
    pub tiers: Vec<Tier>,
}

impl Locality {
    /// Returns the value of the first tier with the given key.
    pub fn find(&self, key: &str) -> Option<&str> {
        self.tiers
            .iter()
            .find(|tier| tier.key == key)
            .map(|tier| tier.value.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }
}

impl fmt::Display for Locality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, Tier { key, value }) in self.tiers.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}

impl FromStr for Locality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Locality::default());
        }
        let tiers = s
            .split(',')
            .map(|tier| match tier.split_once('=') {
                Some((key, value)) if !key.is_empty() && !value.is_empty() => Ok(Tier {
                    key: key.to_owned(),
                    value: value.to_owned(),
                }),
                _ => Err(format!("invalid locality tier {tier:?}: expected key=value")),
            })
            .collect::<Result<_, _>>()?;
        Ok(Locality { tiers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let locality: Locality = "region=us-east1,zone=b".parse().unwrap();
        assert_eq!(locality.tiers.len(), 2);
        assert_eq!(locality.find("zone"), Some("b"));
        assert_eq!(locality.find("rack"), None);
        assert_eq!(locality.to_string(), "region=us-east1,zone=b");

        assert!("".parse::<Locality>().unwrap().is_empty());
        assert!("region".parse::<Locality>().is_err());
        assert!("region=,zone=a".parse::<Locality>().is_err());
    }
}
