//! Scenario System
//!
//! A Scenario describes one complete simulation run: the event schedule,
//! the spin population, the receive coils and how the run is executed.
//!
//! # Identity
//!
//! Two runs with:
//! - The same Scenario
//! - The same seed
//!
//! produce the same signal, whatever the worker count. With load balancing
//! enabled the sums may differ in the last bits (floating-point
//! reassociation).
//!
//! # File Format
//!
//! Scenarios are stored as YAML files:
//!
//! ```yaml
//! apiVersion: larmor/v1
//! kind: Scenario
//!
//! metadata:
//!   name: spin_echo
//!   title: "Spin echo, TE 10 ms"
//!
//! seed: 42
//! workers: 4
//! loadBalancing: { minBatch: 4, maxBatch: 64 }
//!
//! # Nodes are listed flat and refer to their children by name
//! sequence:
//!   root: scan
//!   nodes:
//!     - name: scan
//!       repeat: 2
//!       children: [excite, echo]
//!     - name: excite
//!       block: {}
//!       children: [rf90]
//!     - name: rf90
//!       pulse:
//!         duration: 0.1
//!         rf: { shape: { type: rect, flipAngle: 90 } }
//!     - name: echo
//!       block: {}
//!       children: [wait, rf180, readout]
//!     # ...
//!
//! sample:
//!   grid:
//!     size: [16, 1, 1]
//!     resolution: [0.5, 1.0, 1.0]
//!     template:
//!       position: [0, 0, 0]
//!       pools: [{ m0: 1.0, r1: 0.001, r2: 0.01 }]
//!
//! coils:
//!   - type: ideal
//! ```

mod sequence;
mod types;


pub use sequence::*;
pub use types::*;
