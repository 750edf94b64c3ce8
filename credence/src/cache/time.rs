//! Timestamps in persisted records are decimal strings of Unix seconds
//!
//! Numbers are accepted too, since not every writer sharing a cache file
//! quotes them.

use std::fmt;

use credence_clock::UnixTime;
use serde::{de, Deserializer, Serializer};

pub(crate) fn serialize<S: Serializer>(time: &UnixTime, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(&time.0)
}

pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<UnixTime, D::Error> {
    deserializer.deserialize_any(EpochVisitor)
}

struct EpochVisitor;

impl<'de> de::Visitor<'de> for EpochVisitor {
    type Value = UnixTime;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Unix seconds as a string or integer")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
        Ok(UnixTime(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
        u64::try_from(v)
            .map(UnixTime)
            .map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        v.trim()
            .parse::<u64>()
            .map(UnixTime)
            .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
    }
}

pub(crate) mod option {
    use credence_clock::UnixTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S: Serializer>(
        time: &Option<UnixTime>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match time {
            Some(t) => super::serialize(t, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<UnixTime>, D::Error> {
        #[derive(Deserialize)]
        struct Wrapped(#[serde(with = "super")] UnixTime);

        let wrapped: Option<Wrapped> = Option::deserialize(deserializer)?;
        Ok(wrapped.map(|Wrapped(t)| t))
    }
}
