mod replay;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use stream_video::decoder::LoopbackDecoder;
use stream_video::render::HeadlessSurface;
use stream_video::{CountingCallbacks, FrameType, StreamDecoder, SubmitStatus, VideoFormat};

/// Replay an Annex-B capture through the decoder, presenting to a headless surface.
#[derive(Parser, Clone)]
pub struct Cli {
	#[command(flatten)]
	log: stream_video::Log,

	#[command(flatten)]
	config: stream_video::Config,

	/// The Annex-B file to replay.
	input: PathBuf,

	/// The format of the input.
	#[arg(long, value_enum, default_value = "h264")]
	codec: VideoFormat,

	/// The rate at which pictures are submitted, in frames per second.
	#[arg(long, default_value_t = 60)]
	refresh_rate: i32,

	/// The size of the decoded frames.
	#[arg(long, default_value_t = 1280)]
	width: u32,

	#[arg(long, default_value_t = 720)]
	height: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	cli.log.init();

	let submissions = replay::load(cli.codec.codec(), &cli.input).await?;

	let surface = Arc::new(HeadlessSurface::new());
	let callbacks = Arc::new(CountingCallbacks::default());
	let hardware = LoopbackDecoder::new(cli.width, cli.height);

	let mut decoder = StreamDecoder::new(
		surface.clone(),
		callbacks.clone(),
		Arc::new(hardware.clone()),
		cli.config.clone(),
	);

	decoder
		.setup(cli.codec as i32, cli.refresh_rate)
		.context("failed to setup decoder")?;

	let refresh_rate = decoder.settings().map(|settings| settings.refresh_rate).unwrap_or(60);
	let mut interval = tokio::time::interval(Duration::from_secs(1) / refresh_rate);
	interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

	let mut pictures = 0u32;

	for submission in &submissions {
		if submission.is_picture() {
			interval.tick().await;
			pictures += 1;
		}

		// 90kHz, as an RTP clock would report it.
		let pts = (pictures as u64 * 90_000 / refresh_rate as u64) as u32;

		let length = i32::try_from(submission.data.len()).context("buffer too large")?;
		let status = decoder.submit_decode_buffer(
			&submission.data,
			length,
			submission.buffer_type as i32,
			frame_type_code(submission),
			pts,
		);

		match SubmitStatus::try_from(status) {
			Ok(SubmitStatus::Ok) => {}
			Ok(SubmitStatus::Fatal) => anyhow::bail!("decoder terminated: {:?}", callbacks.terminated()),
			Ok(status) => tracing::debug!(?status, buffer_type = ?submission.buffer_type, "buffer not decoded"),
			Err(_) => anyhow::bail!("unknown submit status: {status}"),
		}
	}

	// Let the last frames come out of the decoder.
	tokio::time::sleep(Duration::from_millis(100)).await;

	let stats = decoder.stats().unwrap_or_default();
	decoder.cleanup();
	surface.sync();

	tracing::info!(
		pictures,
		submitted = stats.submitted,
		presented = surface.presented().len(),
		dropped = stats.dropped,
		lost = stats.lost,
		idr_requests = callbacks.idr_requests(),
		outstanding = hardware.stats().outstanding(),
		"replay done"
	);

	Ok(())
}

fn frame_type_code(submission: &replay::Submission) -> i32 {
	match submission.frame_type {
		FrameType::Idr => 1,
		FrameType::Predicted => 0,
		FrameType::Other(code) => code,
	}
}

