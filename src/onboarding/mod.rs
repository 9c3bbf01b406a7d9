//! Guided Azure onboarding back-end.
//!
//! ## Overview
//!
//! A client posts an onboarding configuration; the service validates it,
//! registers a deployment, and drives Terraform and the Azure CLI through a
//! fixed sequence in the background while streaming progress over a
//! WebSocket. Deployment state lives in memory only.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (router, CORS, shutdown, reaper)     │
//! │          │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘ WebSocket│         │                                        │
//!                       │         │ Orchestrator::start()                  │
//!                       │         v                                        │
//!                       │  pipeline.rs  (Orchestrator, Step)               │
//!                       │         │              │                         │
//!                       │         │ run()        │ publish()               │
//!                       │         v              v                         │
//!                       │  runner.rs        ws.rs  (Broadcaster, socket)   │
//!                       │  (CommandRunner)                                 │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module          | Responsibility                                        |
//! |-----------------|-------------------------------------------------------|
//! | `models`        | `Deployment`, `DeploymentStatus`, `OnboardingConfig`  |
//! | `validate`      | Field-level checks on an `OnboardingConfig`           |
//! | `tfvars`        | Renders `terraform.tfvars`                            |
//! | `registry`      | Deployment map plus per-deployment locks              |
//! | `status`        | Locked snapshot reads by deployment id                |
//! | `reaper`        | Evicts finished deployments after retention           |
//! | `prerequisites` | `az`/`terraform` availability and login checks        |

pub mod api;
pub mod models;
pub mod pipeline;
pub mod prerequisites;
pub mod reaper;
pub mod registry;
pub mod runner;
pub mod server;
pub mod status;
pub mod tfvars;
pub mod validate;
pub mod ws;
