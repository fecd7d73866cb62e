//! Closed string vocabularies (category, unit, status, ...).
//!
//! The wire spelling of every variant is fixed; parsing anything else is a
//! validation error that lists the accepted values.

macro_rules! string_choices {
    ($t:ident, $label:literal, { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $t {
            pub const ALL: &'static [$t] = &[$($t::$variant),+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $($t::$variant => $s),+
                }
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl core::str::FromStr for $t {
            type Err = reliefops_core::DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok($t::$variant),)+
                    _ => Err(reliefops_core::DomainError::validation(format!(
                        "invalid {}. Must be one of: {}",
                        $label,
                        [$($s),+].join(", ")
                    ))),
                }
            }
        }
    };
}

pub(crate) use string_choices;
