//! 🍇欢迎光临🍓
//!
//! 涵盖了本 crate 一系列常用的功能.

pub use crate::{Idx2d, Idx3d};

pub use crate::data::{Orientation, Roi, VolumeStore};
pub use crate::propagate::{Direction, Params, PropagationEngine};

pub use crate::classify::{Classify, OnlineBayes};
pub use crate::energy::{IcmMinimizer, MinimizeEnergy};
pub use crate::features::{FeatureExtract, IntensityFeatures};

pub use crate::consts::seed::{SEED_BACKGROUND, SEED_FOREGROUND, SEED_NONE};
pub use crate::consts::mask::{MASK_BACKGROUND, MASK_FOREGROUND};

pub use crate::error::{CollabError, SegError, Stage};
