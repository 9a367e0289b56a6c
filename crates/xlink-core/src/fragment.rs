use serde::{Deserialize, Serialize};

use crate::mass::mass_to_mz;

/// Opaque identity of a theoretical fragment, assigned by whoever generated
/// the candidates
#[derive(Hash, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct FragmentId(pub u32);

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FragmentKind {
    /// Plain backbone fragment
    #[default]
    Base,
    /// Neutral loss (water, ammonia, ...) of another fragment
    Loss { base: FragmentId },
    /// Fragment carrying the cross-linker and the second peptide
    Crosslinked,
}

/// Anything that can be placed into a [`crate::database::FragmentIndex`]
pub trait Fragment {
    fn id(&self) -> FragmentId;

    /// Uncharged monoisotopic mass
    fn neutral_mass(&self) -> f64;

    fn kind(&self) -> FragmentKind {
        FragmentKind::Base
    }

    /// Fragment this one was derived from by a neutral loss
    fn base(&self) -> Option<FragmentId> {
        match self.kind() {
            FragmentKind::Loss { base } => Some(base),
            _ => None,
        }
    }

    fn is_lossy(&self) -> bool {
        self.base().is_some()
    }

    fn is_crosslinked(&self) -> bool {
        self.kind() == FragmentKind::Crosslinked
    }

    /// m/z of the `charge`-times protonated fragment
    fn mz(&self, charge: u8) -> f64 {
        mass_to_mz(self.neutral_mass(), charge)
    }
}

/// Concrete theoretical fragment, as stored in the index
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FragmentCandidate {
    pub id: FragmentId,
    pub neutral_mass: f64,
    #[serde(default)]
    pub kind: FragmentKind,
}

impl FragmentCandidate {
    pub fn new(id: u32, neutral_mass: f64) -> Self {
        Self {
            id: FragmentId(id),
            neutral_mass,
            kind: FragmentKind::Base,
        }
    }

    pub fn with_kind(self, kind: FragmentKind) -> Self {
        Self { kind, ..self }
    }
}

impl Fragment for FragmentCandidate {
    fn id(&self) -> FragmentId {
        self.id
    }

    fn neutral_mass(&self) -> f64 {
        self.neutral_mass
    }

    fn kind(&self) -> FragmentKind {
        self.kind
    }
}

impl<F: Fragment> Fragment for &F {
    fn id(&self) -> FragmentId {
        (*self).id()
    }

    fn neutral_mass(&self) -> f64 {
        (*self).neutral_mass()
    }

    fn kind(&self) -> FragmentKind {
        (*self).kind()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kinds() {
        let b = FragmentCandidate::new(1, 997.485);
        let loss = FragmentCandidate::new(2, 979.474).with_kind(FragmentKind::Loss {
            base: FragmentId(1),
        });
        let xl = FragmentCandidate::new(3, 2500.0).with_kind(FragmentKind::Crosslinked);

        assert!(!b.is_lossy());
        assert_eq!(b.base(), None);
        assert!(loss.is_lossy());
        assert_eq!(loss.base(), Some(FragmentId(1)));
        assert!(xl.is_crosslinked());
        assert!(!xl.is_lossy());
        assert!((b.mz(2) - 499.7497764).abs() < 1e-6);
    }

    #[test]
    fn deserialize() {
        let frags: Vec<FragmentCandidate> = serde_json::from_str(
            r#"[
                {"id": 1, "neutral_mass": 500.0},
                {"id": 2, "neutral_mass": 482.0, "kind": {"loss": {"base": 1}}},
                {"id": 3, "neutral_mass": 1500.0, "kind": "crosslinked"}
            ]"#,
        )
        .unwrap();
        assert_eq!(frags[0].kind, FragmentKind::Base);
        assert_eq!(
            frags[1].kind,
            FragmentKind::Loss {
                base: FragmentId(1)
            }
        );
        assert_eq!(frags[2].kind, FragmentKind::Crosslinked);
    }
}
