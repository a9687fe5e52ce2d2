//! # loglat
//!
//! Discriminative training and Viterbi decoding for acyclic weighted
//! finite-state transducers.
//!
//! A training sample is a pair of lattices over the same sentence: a
//! hypothesis lattice (the search space, multiplier +1) and a reference
//! lattice (multiplier -1). Template patterns generate sparse features from
//! the token sequences of arc labels; the trainer learns one weight per
//! feature so that the log-linear distribution over paths concentrates on
//! the reference paths. Decoding returns the highest-scoring path of a
//! lattice under the trained weights.
//!
//! ## Example
//!
//! ```rust
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use std::io::Cursor;
//! use std::sync::Arc;
//!
//! use loglat::{decode, Dataset, Generator, Model, Rprop, StringPool};
//!
//! let pool = Arc::new(StringPool::new(true));
//! let mut model = Model::new(Arc::clone(&pool));
//! let mut gen = Generator::new(Arc::clone(&pool), false);
//! gen.add_pattern("0:u:0s0")?;
//!
//! // Hypothesis space: two parallel arcs. Reference: the `a` arc.
//! let mut train = Dataset::new();
//! train.load_reader(Cursor::new("0 1 a x\n0 1 b y\n1\nEOS\n"), &model, 1.0, 0)?;
//! train.load_reader(Cursor::new("0 1 a x\n1\nEOS\n"), &model, -1.0, 0)?;
//!
//! let rprop = Rprop::default();
//! for itr in 1..=5 {
//!     model.set_iteration(itr);
//!     let fx = loglat::gradient::compute(&model, &gen, &mut train, 1, 0)?;
//!     rprop.step(&mut model, fx);
//! }
//!
//! // The trained model picks the reference arc.
//! let mut test = Dataset::new();
//! test.load_reader(Cursor::new("0 1 a x\n0 1 b y\n1\nEOS\n"), &model, 0.0, 0)?;
//! let mut out = Vec::new();
//! decode(&model, &gen, &mut test, &mut out)?;
//! assert_eq!("a@x \n", String::from_utf8(out)?);
//! # Ok(())
//! # }
//! ```

pub mod dataset;
pub mod decoder;
pub mod errors;
pub mod fst;
pub mod gradient;
pub mod hash;
pub mod map;
pub mod math;
pub mod model;
pub mod pattern;
pub mod pool;
pub mod rprop;
mod utils;

pub use dataset::Dataset;
pub use decoder::{decode, dump_spaces};
pub use errors::{LoglatError, Result};
pub use fst::Fst;
pub use map::Map;
pub use model::{Feature, Label, Model};
pub use pattern::{Generator, Pattern};
pub use pool::StringPool;
pub use rprop::Rprop;
