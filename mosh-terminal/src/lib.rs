//! VT-500-class terminal emulation, differential display rendering, local
//! echo prediction, and the two synchronized states (terminal and user
//! input) that ride on top of the transport layer.

pub mod cell;
pub mod complete_terminal;
pub mod dispatcher;
pub mod display;
pub mod emulator;
pub mod framebuffer;
pub mod notification;
pub mod parser;
pub mod prediction;
pub mod user_stream;

pub use cell::{Cell, Color, Renditions};
pub use complete_terminal::CompleteTerminal;
pub use emulator::Emulator;
pub use framebuffer::{DrawState, Framebuffer, Row};
pub use notification::{NotificationEngine, OverlayManager, TitleEngine};
pub use prediction::{DisplayPreference, PredictionEngine};
pub use user_stream::{UserEvent, UserStream};
