//! Execution phases of a flow

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One fixed step in a flow's execution order.
///
/// The declaration order is the execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Setup,
    Initialize,
    Import,
    Prologue,
    Main,
    Epilogue,
    Export,
    Finalize,
    Cleanup,
}

impl Phase {
    pub const ALL: [Phase; 9] = [
        Phase::Setup,
        Phase::Initialize,
        Phase::Import,
        Phase::Prologue,
        Phase::Main,
        Phase::Epilogue,
        Phase::Export,
        Phase::Finalize,
        Phase::Cleanup,
    ];

    /// Symbol used in the graph store and on the command line
    pub fn symbol(&self) -> &'static str {
        match self {
            Phase::Setup => "setup",
            Phase::Initialize => "initialize",
            Phase::Import => "import",
            Phase::Prologue => "prologue",
            Phase::Main => "main",
            Phase::Epilogue => "epilogue",
            Phase::Export => "export",
            Phase::Finalize => "finalize",
            Phase::Cleanup => "cleanup",
        }
    }

    pub fn from_symbol(symbol: &str) -> Option<Phase> {
        Phase::ALL
            .into_iter()
            .find(|p| p.symbol().eq_ignore_ascii_case(symbol.trim()))
    }

    /// Phases strictly before this one
    pub fn predecessors(&self) -> impl Iterator<Item = Phase> {
        let current = *self;
        Phase::ALL.into_iter().take_while(move |p| *p < current)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::from_symbol(s).ok_or_else(|| {
            let known: Vec<&str> = Phase::ALL.iter().map(|p| p.symbol()).collect();
            format!("Unknown phase '{}' (expected one of: {})", s, known.join(", "))
        })
    }
}
