#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Aquarium CO2 controller core (hardware-agnostic).
//!
//! All device I/O goes through `aqua_traits::DeviceLink`, time through
//! `aqua_traits::Clock` and randomness through `aqua_traits::RandomSource`.
//!
//! ## Architecture
//!
//! - **Protocol**: telemetry line decoder and command encoder (`protocol`)
//! - **Gateway**: serial link ownership, reopen, counters, command write-back (`gateway`)
//! - **Sensors**: pH, temperature and CO2 averaging over time windows (`sensors`, `averaging`)
//! - **Controller**: target pH curve and the valve decision rules (`controller`)
//! - **Prediction**: closing episodes, dataset and trough predictor (`episode`,
//!   `dataset`, `predictor`, `prediction`)
//! - **Runtime**: the cooperative loop tying it all together (`runtime`)

pub mod atomic;
pub mod averaging;
pub mod controller;
pub mod conversions;
pub mod dataset;
pub mod episode;
pub mod error;
pub mod gateway;
pub mod mocks;
pub mod prediction;
pub mod predictor;
pub mod protocol;
pub mod runtime;
pub mod sensors;
pub mod stream;
pub mod util;

pub use averaging::AveragingWindow;
pub use controller::{Co2Controller, Co2Decision, DecisionReason, PhControllerConfig, TargetCurve};
pub use dataset::{DatasetKind, DatasetStore, FileDatasetStore, MemoryDatasetStore};
pub use episode::{Co2ClosingState, EpisodeOrigin, HistoryMaps};
pub use error::{AquaError, DatasetError, ProtocolError, Result};
pub use gateway::{DeviceGateway, GatewayStats};
pub use prediction::{MinPhPrediction, PredictionOrchestrator};
pub use predictor::{LinearPredictor, Predictor, PredictorWorker};
pub use runtime::{AquaRuntime, RuntimeTiming, Sensors};
