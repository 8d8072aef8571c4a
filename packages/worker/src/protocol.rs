use {
	clap::Parser as _,
	std::path::PathBuf,
	sysroot_error::{Kind, Result, error},
};

/// A work request, one JSON object per line.
#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
	/// Zero for a worker that handles one request at a time, which is also the default.
	#[serde(default)]
	pub request_id: u64,

	pub arguments: Vec<String>,

	/// Seconds before the build is killed.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub timeout: Option<u64>,
}

/// A work response, one JSON object per line.
#[derive(Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
	pub request_id: u64,

	/// Zero on success.
	pub exit_code: i32,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub output: Option<String>,
}

/// The arguments a request carries.
#[derive(Clone, Debug, PartialEq, Eq, clap::Parser)]
#[command(name = "request", no_binary_name = true)]
pub struct Arguments {
	/// The build script.
	#[arg(long)]
	pub script: PathBuf,

	/// The marker created when the build succeeds.
	#[arg(long)]
	pub done: PathBuf,

	/// The file that receives the build's output.
	#[arg(long)]
	pub log: PathBuf,
}

impl Request {
	/// Parse a frame. Anything that is not a complete request is a protocol fault.
	pub fn parse(line: &str) -> Result<Self> {
		serde_json::from_str(line)
			.map_err(|source| error!(!source, kind = Kind::Protocol, "failed to parse the request"))
	}

	pub fn parse_arguments(&self) -> Result<Arguments> {
		Arguments::try_parse_from(&self.arguments).map_err(|source| {
			error!(
				!source,
				kind = Kind::Protocol,
				%request = self.request_id,
				"invalid request arguments"
			)
		})
	}
}

impl Response {
	#[must_use]
	pub fn new(request_id: u64, exit_code: i32) -> Self {
		Self {
			request_id,
			exit_code,
			output: None,
		}
	}

	#[must_use]
	pub fn with_output(mut self, output: impl Into<String>) -> Self {
		self.output = Some(output.into());
		self
	}
}

#[cfg(test)]
mod tests {
	use {
		super::{Arguments, Request, Response},
		pretty_assertions::assert_eq,
		sysroot_error::Kind,
	};

	#[test]
	fn requests_follow_the_json_worker_protocol() {
		let request = Request::parse(
			r#"{"requestId":3,"arguments":["--script","build.sh","--done","done","--log","build.log"]}"#,
		)
		.unwrap();
		assert_eq!(request.request_id, 3);
		assert_eq!(request.timeout, None);
		assert_eq!(
			request.parse_arguments().unwrap(),
			Arguments {
				script: "build.sh".into(),
				done: "done".into(),
				log: "build.log".into(),
			}
		);

		let request = Request::parse(r#"{"arguments":[]}"#).unwrap();
		assert_eq!(request.request_id, 0);
	}

	#[test]
	fn incomplete_requests_are_protocol_faults() {
		let error = Request::parse(r#"{"requestId":1}"#).unwrap_err();
		assert_eq!(error.kind(), Some(Kind::Protocol));
		let error = Request::parse("not json").unwrap_err();
		assert_eq!(error.kind(), Some(Kind::Protocol));
		let request = Request::parse(r#"{"requestId":1,"arguments":["--script","a.sh","--log","a.log"]}"#).unwrap();
		let error = request.parse_arguments().unwrap_err();
		assert_eq!(error.kind(), Some(Kind::Protocol));
	}

	#[test]
	fn responses_omit_empty_output() {
		let response = serde_json::to_string(&Response::new(7, 0)).unwrap();
		assert_eq!(response, r#"{"requestId":7,"exitCode":0}"#);
		let response = serde_json::to_string(&Response::new(8, 124).with_output("timeout")).unwrap();
		assert_eq!(response, r#"{"requestId":8,"exitCode":124,"output":"timeout"}"#);
	}
}
