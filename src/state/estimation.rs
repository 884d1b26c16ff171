use std::fmt;
use std::hash::{Hash, Hasher};

use indexmap::IndexSet;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// JSON spelling of the infinity sentinel.
const INFINITY_LITERAL: &str = "Infinity";

/// A single estimation value: a number, positive infinity, or the unknown
/// card (`null` on the wire).
///
/// All three forms round-trip exactly through every codec. Equality and
/// hashing compare bit patterns so infinity and ordinary numbers behave as
/// plain set members.
#[derive(Debug, Clone, Copy)]
pub struct Estimation(Option<f64>);

impl Estimation {
    /// The unknown card, serialized as `null`.
    pub const UNKNOWN: Estimation = Estimation(None);
    /// The infinity sentinel, serialized as the string literal `"Infinity"`.
    pub const INFINITY: Estimation = Estimation(Some(f64::INFINITY));

    /// A finite numeric estimation.
    pub fn number(value: f64) -> Self {
        Estimation(Some(value))
    }

    /// Underlying numeric value; `None` for the unknown card.
    pub fn value(&self) -> Option<f64> {
        self.0
    }

    /// Whether this is the infinity sentinel.
    pub fn is_infinite(&self) -> bool {
        matches!(self.0, Some(v) if v.is_infinite() && v.is_sign_positive())
    }
}

impl PartialEq for Estimation {
    fn eq(&self, other: &Self) -> bool {
        self.0.map(f64::to_bits) == other.0.map(f64::to_bits)
    }
}

impl Eq for Estimation {}

impl Hash for Estimation {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.map(f64::to_bits).hash(state);
    }
}

impl fmt::Display for Estimation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            None => f.write_str("?"),
            Some(v) if v.is_infinite() => f.write_str(INFINITY_LITERAL),
            Some(v) => write!(f, "{v}"),
        }
    }
}

impl Serialize for Estimation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            None => serializer.serialize_none(),
            Some(v) if v.is_infinite() && v.is_sign_positive() => {
                serializer.serialize_str(INFINITY_LITERAL)
            }
            Some(v) => serializer.serialize_f64(v),
        }
    }
}

impl<'de> Deserialize<'de> for Estimation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EstimationVisitor;

        impl<'de> Visitor<'de> for EstimationVisitor {
            type Value = Estimation;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("null, a number, or the string \"Infinity\"")
            }

            fn visit_none<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(Estimation::UNKNOWN)
            }

            fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
                Ok(Estimation::UNKNOWN)
            }

            fn visit_some<D2: Deserializer<'de>>(
                self,
                deserializer: D2,
            ) -> Result<Self::Value, D2::Error> {
                deserializer.deserialize_any(EstimationVisitor)
            }

            fn visit_f64<E: de::Error>(self, value: f64) -> Result<Self::Value, E> {
                Ok(Estimation::number(value))
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
                Ok(Estimation::number(value as f64))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
                Ok(Estimation::number(value as f64))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                if value == INFINITY_LITERAL {
                    Ok(Estimation::INFINITY)
                } else {
                    Err(de::Error::invalid_value(de::Unexpected::Str(value), &self))
                }
            }
        }

        deserializer.deserialize_option(EstimationVisitor)
    }
}

/// Ordered set of estimation values a team can pick from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Deck(IndexSet<Estimation>);

impl Deck {
    /// Build a deck from an ordered list of values, dropping duplicates.
    pub fn from_values(values: impl IntoIterator<Item = Estimation>) -> Self {
        Deck(values.into_iter().collect())
    }

    /// The classic planning poker deck, infinity and the unknown card included.
    pub fn standard() -> Self {
        let mut values: Vec<Estimation> = [
            0.0, 0.5, 1.0, 2.0, 3.0, 5.0, 8.0, 13.0, 20.0, 40.0, 100.0,
        ]
        .iter()
        .map(|v| Estimation::number(*v))
        .collect();
        values.push(Estimation::INFINITY);
        values.push(Estimation::UNKNOWN);
        Deck::from_values(values)
    }

    /// Fibonacci-style deck.
    pub fn fibonacci() -> Self {
        let mut values: Vec<Estimation> = [
            0.0, 1.0, 2.0, 3.0, 5.0, 8.0, 13.0, 21.0, 34.0, 55.0, 89.0,
        ]
        .iter()
        .map(|v| Estimation::number(*v))
        .collect();
        values.push(Estimation::INFINITY);
        values.push(Estimation::UNKNOWN);
        Deck::from_values(values)
    }

    /// Simple 1..=10 rating deck.
    pub fn rating() -> Self {
        Deck::from_values((1..=10).map(|v| Estimation::number(v as f64)))
    }

    /// Whether the deck offers the given value.
    pub fn contains(&self, value: &Estimation) -> bool {
        self.0.contains(value)
    }

    /// Number of values in the deck.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the deck is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate the deck in display order.
    pub fn iter(&self) -> impl Iterator<Item = &Estimation> {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_round_trips_through_json() {
        for value in [0.0, 0.5, 20.0] {
            let estimation = Estimation::number(value);
            let json = serde_json::to_string(&estimation).unwrap();
            let back: Estimation = serde_json::from_str(&json).unwrap();
            assert_eq!(back, estimation);
        }
    }

    #[test]
    fn unknown_serializes_as_null() {
        assert_eq!(serde_json::to_string(&Estimation::UNKNOWN).unwrap(), "null");
        let back: Estimation = serde_json::from_str("null").unwrap();
        assert_eq!(back, Estimation::UNKNOWN);
    }

    #[test]
    fn infinity_serializes_as_literal() {
        let json = serde_json::to_string(&Estimation::INFINITY).unwrap();
        assert_eq!(json, "\"Infinity\"");
        let back: Estimation = serde_json::from_str(&json).unwrap();
        assert!(back.is_infinite());
        assert_eq!(back, Estimation::INFINITY);
    }

    #[test]
    fn unexpected_string_is_rejected() {
        assert!(serde_json::from_str::<Estimation>("\"NaN\"").is_err());
    }

    #[test]
    fn standard_deck_has_sentinels() {
        let deck = Deck::standard();
        assert!(deck.contains(&Estimation::INFINITY));
        assert!(deck.contains(&Estimation::UNKNOWN));
        assert!(deck.contains(&Estimation::number(0.5)));
        assert_eq!(deck.len(), 13);
    }

    #[test]
    fn duplicate_values_collapse() {
        let deck = Deck::from_values([
            Estimation::number(1.0),
            Estimation::number(1.0),
            Estimation::UNKNOWN,
        ]);
        assert_eq!(deck.len(), 2);
    }
}
