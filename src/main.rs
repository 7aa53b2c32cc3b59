use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use harken::devices::{Command as DeviceCommand, DeviceKind};
use harken::llm::OllamaModel;
use harken::voice::{
    AudioCapture, AudioPlayback, CapturePipe, HttpSpeechToText, HttpTextToSpeech, MicFrameSource,
    Player, SpeechSynthesizer, UtteranceSegmenter, rms_energy,
};
use harken::{Assistant, BrokerMessage, Config, FileBroker, MessageQueue, TailFrom};

/// Harken - full-duplex voice assistant gateway
#[derive(Parser)]
#[command(name = "harken", version, about)]
struct Cli {
    /// Path to config.toml (defaults to the platform config dir)
    #[arg(short, long, env = "HARKEN_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Tail the command topic and print received commands (device simulator)
    Listen {
        /// Topic to subscribe to (defaults to the configured command topic)
        #[arg(short, long)]
        topic: Option<String>,

        /// Replay the whole log instead of only new commands
        #[arg(long)]
        from_start: bool,
    },
    /// Measure ambient noise and recommend an energy threshold
    Calibrate {
        /// Duration in seconds
        #[arg(short, long, default_value = "10")]
        duration: u64,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Test TTS output
    TestTts {
        /// Text to speak
        #[arg(default_value = "你好，我是你的智能助手。")]
        text: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,harken=info",
        1 => "info,harken=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref())?;

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::Listen { topic, from_start } => cmd_listen(config, topic, from_start).await,
            Command::Calibrate { duration } => cmd_calibrate(&config, duration).await,
            Command::TestMic { duration } => cmd_test_mic(&config, duration).await,
            Command::TestSpeaker => cmd_test_speaker(),
            Command::TestTts { text } => cmd_test_tts(&config, &text).await,
        };
    }

    run_assistant(config).await
}

/// Run the interaction loop until interrupted
async fn run_assistant(config: Config) -> anyhow::Result<()> {
    tracing::info!(
        threshold = config.audio.energy_threshold,
        silence_limit_secs = config.audio.silence_limit_secs,
        topic = %config.broker.command_topic,
        "starting harken gateway"
    );

    let broker = FileBroker::open(&config.broker_log_path(), config.poll_interval())?;
    let recognizer = HttpSpeechToText::new(&config.stt)?;
    let model = OllamaModel::new(&config.llm)?;
    let synthesizer = HttpTextToSpeech::new(&config.tts)?;
    let player = AudioPlayback::new()?;

    let segmenter = UtteranceSegmenter::new(
        config.audio.energy_threshold,
        config.audio.silence_limit_secs,
        config.audio.sample_rate,
    );

    let sample_rate = config.audio.sample_rate;
    let frame_size = config.audio.frame_size;
    let mut pipe = CapturePipe::start(
        move |running| MicFrameSource::open(sample_rate, frame_size, running),
        segmenter,
        config.audio.queue_capacity,
    )
    .await?;

    // Ctrl-C shutdown signal
    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(()).await;
        }
    });

    tracing::info!("harken ready - speak whenever you like");

    let mut assistant = Assistant::new(config, broker, recognizer, model, synthesizer, player);
    assistant.run(&mut pipe, &mut shutdown_rx).await?;

    Ok(())
}

/// Tail the command topic and print everything that arrives
async fn cmd_listen(config: Config, topic: Option<String>, from_start: bool) -> anyhow::Result<()> {
    let topic = topic.unwrap_or_else(|| config.broker.command_topic.clone());
    let broker = FileBroker::open(&config.broker_log_path(), config.poll_interval())?;

    let queue = MessageQueue::bounded(100);
    let from = if from_start {
        TailFrom::Start
    } else {
        TailFrom::End
    };
    let tailer = broker.tail(vec![topic.clone()], queue.clone(), from);

    println!("Listening on topic '{topic}' ({})", broker.log_path().display());
    println!("Press Ctrl-C to stop\n");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            message = queue.recv() => print_command(&message),
        }
    }

    tailer.abort();
    println!("\nStopped");
    Ok(())
}

/// Pretty-print one received command with simulated device feedback
fn print_command(message: &BrokerMessage) {
    match serde_json::from_value::<DeviceCommand>(message.payload.clone()) {
        Ok(command) => {
            println!(
                "[{}] {} -> {}",
                message.timestamp.format("%Y-%m-%d %H:%M:%S"),
                message.topic,
                command.describe()
            );
            println!("  {}", simulated_feedback(&command));
        }
        Err(_) => {
            println!(
                "[{}] {} -> {}",
                message.timestamp.format("%Y-%m-%d %H:%M:%S"),
                message.topic,
                message.payload
            );
        }
    }
}

/// Feedback a real device would send back
fn simulated_feedback(command: &DeviceCommand) -> String {
    if command.kind == DeviceKind::Temperature {
        return "当前温度：25°C（模拟数据）".to_string();
    }
    match command.action.as_str() {
        "开" => format!("已经打开了{}", command.kind.display_name()),
        "关" => format!("已经关闭了{}", command.kind.display_name()),
        _ => format!("已执行：{}", command.describe()),
    }
}

/// Sample ambient energy and recommend a threshold
async fn cmd_calibrate(config: &Config, duration: u64) -> anyhow::Result<()> {
    println!("Measuring ambient noise for {duration} seconds...");
    println!("Stay quiet first to see the noise floor, then speak to see the speech peak\n");

    let mut capture = AudioCapture::new(config.audio.sample_rate)?;
    capture.start()?;

    let mut min_energy = f32::MAX;
    let mut max_energy: f32 = 0.0;

    let ticks = duration * 10;
    for _ in 0..ticks {
        tokio::time::sleep(Duration::from_millis(100)).await;

        let samples = capture.take_buffer();
        if samples.is_empty() {
            continue;
        }
        let energy = rms_energy(&samples);
        min_energy = min_energy.min(energy);
        max_energy = max_energy.max(energy);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let bar_len = ((energy / 100.0) as usize).min(50);
        println!(
            "RMS: {energy:7.1} | min: {min_energy:7.1} | max: {max_energy:7.1} | {}",
            "#".repeat(bar_len)
        );
    }

    capture.stop();

    if max_energy <= 0.0 {
        println!("\nNo audio captured - check your microphone");
        return Ok(());
    }

    // At least 500, or twice the noise floor; keep well under the speech peak
    let mut recommended = (min_energy * 2.0).max(500.0);
    if recommended > max_energy * 0.8 {
        recommended = max_energy * 0.5;
    }

    println!("\nNoise floor (min): {min_energy:.1}");
    println!("Speech peak (max): {max_energy:.1}");
    println!("Recommended energy_threshold: {recommended:.0}");
    Ok(())
}

/// Test microphone input with a live level meter
async fn cmd_test_mic(config: &Config, duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut capture = AudioCapture::new(config.audio.sample_rate)?;
    capture.start()?;

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let samples = capture.take_buffer();
        let energy = rms_energy(&samples);
        let peak = samples.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = ((energy / 100.0) as usize).min(50);
        let meter = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!("[{:2}s] RMS: {energy:7.1} | Peak: {peak:5} | [{meter}]", i + 1);
    }

    capture.stop();

    println!("\n---");
    println!("If the meter moved while you spoke, your mic is working.");
    println!("If RMS stayed near 0, check your input device and levels.");
    Ok(())
}

/// Test speaker output with a sine tone
fn cmd_test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let mut playback = AudioPlayback::new()?;

    let sample_rate = 24000_u32;
    let frequency = 440.0_f32;
    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..sample_rate * 2)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3
        })
        .collect();

    playback.play_samples(samples)?;

    println!("If you heard the tone, your speakers are working.");
    Ok(())
}

/// Test TTS synthesis and playback
async fn cmd_test_tts(config: &Config, text: &str) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");

    let synthesizer = HttpTextToSpeech::new(&config.tts)?;

    println!("Synthesizing speech...");
    let audio = synthesizer.synthesize(text).await?;
    println!("Got {} bytes of audio data", audio.len());

    println!("Playing audio...");
    let mut playback = AudioPlayback::new()?;
    playback.play_mp3(&audio).await?;

    println!("\nIf you heard the speech, TTS is working.");
    Ok(())
}
