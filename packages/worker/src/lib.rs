pub use self::{
	engine::{Engine, Outcome},
	protocol::{Arguments, Request, Response},
	worker::{Options, State, TIMEOUT_EXIT_CODE, Worker},
};

mod engine;
pub mod normalize;
pub mod protocol;
mod worker;
