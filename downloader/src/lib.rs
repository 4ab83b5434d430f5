/// Vidbot media pipeline.
///
/// Turns a link into one or more uploaded files: normalize the URL, run
/// yt-dlp, then compress or split the result with ffmpeg until every piece
/// fits under the transport limit.
pub mod fetch;
pub mod media;
pub mod normalize;
pub mod pipeline;
pub mod request;
pub mod runner;

pub use fetch::{locate_artifact, FetchInvoker};
pub use media::{FfmpegToolkit, MediaToolkit};
pub use normalize::normalize;
pub use pipeline::{ChatSink, DeliveryOutcome, DeliveryPipeline, DeliveryPolicy, PipelineLimits};
pub use request::{run_request, RequestContext, RequestSummary};
pub use runner::{ProcessRunner, ToolOutput, ToolRunner};
