//! Covariance option codes.
//!
//! An option code is a short, case-insensitive string of independent flags,
//! e.g. `"u"`, `"%f"`, `"gpr"` or `"cof"`. We decode it once into a
//! [`CovOption`] so that matrix construction never looks at option text.
//!
//! Flags:
//!
//! | flag | meaning |
//! |------|---------|
//! | `u`  | uncorrelated |
//! | `f`  | fully correlated |
//! | `a`  | anti-correlated |
//! | `p`  | partially correlated (min-error envelope) |
//! | `g`  | global, combined with `p`: common minimum error |
//! | `r`  | relative: `gp` common part scales with the value; fit shift is multiplicative |
//! | `c`  | explicit correlation coefficients from the `[covariances]` section |
//! | `o`  | onionisation of `c` elements |
//! | `m`  | per-element option codes from the `[covariances]` section |
//! | `q`  | recompute the total-covariance contribution at the group average |
//! | `%`  | errors are given in percent of the measured value |

use std::fmt;
use std::str::FromStr;

const KNOWN_FLAGS: &str = "ufapgrcomq%";

/// Correlation rule of a whole error source.
///
/// Variants are listed in decoding precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CovKind {
    GlobalPartialRelative,
    GlobalPartial,
    Full,
    Anti,
    Partial,
    Uncorrelated,
    Explicit { onion: bool },
    Mixed,
}

/// Decoded option code of an error source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CovOption {
    pub kind: CovKind,
    /// Nuisance shifts act multiplicatively in the fit.
    pub relative: bool,
    /// Errors are declared in percent of the measured value.
    pub percent: bool,
    /// Total-covariance contribution recomputed at the group average.
    pub group_average: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct Flags {
    u: bool,
    f: bool,
    a: bool,
    p: bool,
    g: bool,
    r: bool,
    c: bool,
    o: bool,
    m: bool,
    q: bool,
    percent: bool,
}

impl Flags {
    fn decode(code: &str) -> Result<Self, String> {
        let mut flags = Flags::default();
        for ch in code.trim().chars() {
            match ch.to_ascii_lowercase() {
                'u' => flags.u = true,
                'f' => flags.f = true,
                'a' => flags.a = true,
                'p' => flags.p = true,
                'g' => flags.g = true,
                'r' => flags.r = true,
                'c' => flags.c = true,
                'o' => flags.o = true,
                'm' => flags.m = true,
                'q' => flags.q = true,
                '%' => flags.percent = true,
                other => {
                    return Err(format!(
                        "unknown flag '{other}' in option '{code}' (known flags: {KNOWN_FLAGS})"
                    ));
                }
            }
        }
        Ok(flags)
    }
}

impl FromStr for CovOption {
    type Err = String;

    fn from_str(code: &str) -> Result<Self, Self::Err> {
        let flags = Flags::decode(code)?;

        if flags.g && !flags.p {
            return Err(format!("option '{code}': 'g' needs 'p'"));
        }
        if flags.o && !flags.c {
            return Err(format!("option '{code}': 'o' needs 'c'"));
        }

        let kind = if flags.g && flags.p && flags.r {
            CovKind::GlobalPartialRelative
        } else if flags.g && flags.p {
            CovKind::GlobalPartial
        } else if flags.f {
            CovKind::Full
        } else if flags.a {
            CovKind::Anti
        } else if flags.p {
            CovKind::Partial
        } else if flags.u {
            CovKind::Uncorrelated
        } else if flags.c {
            CovKind::Explicit { onion: flags.o }
        } else if flags.m {
            CovKind::Mixed
        } else {
            return Err(format!("option '{code}' does not name a correlation rule"));
        };

        Ok(CovOption {
            kind,
            relative: flags.r,
            percent: flags.percent,
            group_average: flags.q,
        })
    }
}

impl CovOption {
    /// Whether the source reads a list from the `[covariances]` section.
    pub fn needs_correlation_data(&self) -> bool {
        matches!(self.kind, CovKind::Explicit { .. } | CovKind::Mixed)
    }
}

/// Correlation rule of a single covariance element (used by `m` sources).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementRule {
    Full,
    Anti,
    Partial,
    Uncorrelated,
}

impl FromStr for ElementRule {
    type Err = String;

    /// Exactly one of `f`, `a`, `p`, `u`; modifier flags are not allowed.
    fn from_str(code: &str) -> Result<Self, Self::Err> {
        let mut chars = code.trim().chars().map(|c| c.to_ascii_lowercase());
        let rule = match (chars.next(), chars.next()) {
            (Some('f'), None) => ElementRule::Full,
            (Some('a'), None) => ElementRule::Anti,
            (Some('p'), None) => ElementRule::Partial,
            (Some('u'), None) => ElementRule::Uncorrelated,
            _ => return Err(format!("element option '{code}' must be f, a, p or u")),
        };
        Ok(rule)
    }
}

impl ElementRule {
    /// Covariance element for errors `e1`, `e2`; `diagonal` marks `i == j`.
    pub fn covariance(self, e1: f64, e2: f64, diagonal: bool) -> f64 {
        match self {
            ElementRule::Full => e1 * e2,
            ElementRule::Anti if diagonal => e1 * e1,
            ElementRule::Anti => -e1 * e2,
            ElementRule::Partial => e1.min(e2).powi(2),
            ElementRule::Uncorrelated if diagonal => e1 * e1,
            ElementRule::Uncorrelated => 0.0,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            ElementRule::Full => "f",
            ElementRule::Anti => "a",
            ElementRule::Partial => "p",
            ElementRule::Uncorrelated => "u",
        }
    }
}

impl fmt::Display for ElementRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(code: &str) -> CovOption {
        code.parse().unwrap()
    }

    #[test]
    fn decodes_simple_kinds_case_insensitively() {
        assert_eq!(parse("u").kind, CovKind::Uncorrelated);
        assert_eq!(parse("F").kind, CovKind::Full);
        assert_eq!(parse("a").kind, CovKind::Anti);
        assert_eq!(parse("P").kind, CovKind::Partial);
        assert_eq!(parse("c").kind, CovKind::Explicit { onion: false });
        assert_eq!(parse("CO").kind, CovKind::Explicit { onion: true });
        assert_eq!(parse("m").kind, CovKind::Mixed);
    }

    #[test]
    fn global_partial_takes_precedence() {
        assert_eq!(parse("gp").kind, CovKind::GlobalPartial);
        let gpr = parse("gpr");
        assert_eq!(gpr.kind, CovKind::GlobalPartialRelative);
        assert!(gpr.relative);
        // Flags are independent characters, order does not matter.
        assert_eq!(parse("rpg").kind, CovKind::GlobalPartialRelative);
    }

    #[test]
    fn full_wins_over_partial() {
        assert_eq!(parse("fp").kind, CovKind::Full);
    }

    #[test]
    fn modifier_flags_are_recorded() {
        let opt = parse("%fq");
        assert_eq!(opt.kind, CovKind::Full);
        assert!(opt.percent);
        assert!(opt.group_average);
        assert!(!opt.relative);
        assert!(parse("fr").relative);
    }

    #[test]
    fn rejects_unknown_and_incomplete_codes() {
        assert!("x".parse::<CovOption>().is_err());
        assert!("ux".parse::<CovOption>().is_err());
        assert!("".parse::<CovOption>().is_err());
        assert!("%".parse::<CovOption>().is_err());
        assert!("g".parse::<CovOption>().is_err());
        assert!("uo".parse::<CovOption>().is_err());
    }

    #[test]
    fn element_rules() {
        let f: ElementRule = "f".parse().unwrap();
        let a: ElementRule = "A".parse().unwrap();
        let p: ElementRule = "p".parse().unwrap();
        let u: ElementRule = "u".parse().unwrap();
        assert_eq!(f.covariance(2.0, 3.0, false), 6.0);
        assert_eq!(a.covariance(2.0, 3.0, false), -6.0);
        assert_eq!(a.covariance(2.0, 2.0, true), 4.0);
        assert_eq!(p.covariance(2.0, 3.0, false), 4.0);
        assert_eq!(u.covariance(2.0, 3.0, false), 0.0);
        assert_eq!(u.covariance(3.0, 3.0, true), 9.0);
        assert!("c".parse::<ElementRule>().is_err());
    }

    #[test]
    fn element_codes_carry_a_single_rule() {
        assert_eq!(" F ".parse::<ElementRule>(), Ok(ElementRule::Full));
        for code in ["fp", "pf", "uq", "f%", "fr", "", "uu"] {
            assert!(code.parse::<ElementRule>().is_err(), "accepted '{code}'");
        }
    }
}
