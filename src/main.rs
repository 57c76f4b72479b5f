use std::io::Write as _;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tracing_subscriber::EnvFilter;

use arc_agent::agent::{Interrupted, Interrupter, OpenAiCompatProvider, Orchestrator, ReasoningEngine, TurnOutcome};
use arc_agent::mcp::McpManager;
use arc_agent::tools::{ToolRegistry, memory_tools, system_tools, web_tools};
use arc_agent::voice::{
    AudioSink, AudioSource, HttpSynthesizer, HttpTranscriber, MicrophoneSource, Pcm, SAMPLE_RATE,
    SpeakerSink, SpeechLoop, Synthesizer, UtteranceDetector, VoiceSession, rms,
};
use arc_agent::db::normalize_key;
use arc_agent::{Config, MemoryStore};

/// ARC - local voice and text assistant
#[derive(Parser)]
#[command(name = "arc", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive text chat (default)
    Chat,
    /// Hands-free voice session
    Voice,
    /// Inspect or edit long-term memory
    Memory {
        #[command(subcommand)]
        action: MemoryCommand,
    },
    /// List available tools, including those from protocol servers
    Tools,
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Test speech synthesis
    TestTts {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
    },
}

#[derive(Subcommand)]
enum MemoryCommand {
    /// Show one fact
    Get { key: String },
    /// Store or replace a fact
    Put { key: String, value: String },
    /// Search facts by relevance
    Search {
        query: String,
        #[arg(short, long, default_value = "5")]
        limit: usize,
    },
    /// Delete a fact
    Forget { key: String },
    /// List every fact
    List,
    /// Show recent tool activity
    Episodes {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Delete all facts and tool activity
    Clear {
        /// Required confirmation
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "warn,arc_agent=info",
        1 => "info,arc_agent=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(std::io::stderr)
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
    let command = cli.command.unwrap_or(Command::Chat);

    match command {
        Command::TestMic { duration } => return test_mic(duration).await,
        Command::TestSpeaker => return test_speaker().await,
        _ => {}
    }

    let config = Config::load()?;
    tracing::debug!(?config, "loaded configuration");

    match command {
        Command::Chat => chat(&config).await,
        Command::Voice => voice(&config).await,
        Command::Memory { action } => memory(&config, action),
        Command::Tools => list_tools(&config).await,
        Command::TestTts { text } => test_tts(&config, &text).await,
        Command::TestMic { .. } | Command::TestSpeaker => Ok(()),
    }
}

/// Open memory, register tools, start protocol servers, build the orchestrator
async fn build_orchestrator(config: &Config) -> anyhow::Result<(Orchestrator, McpManager)> {
    let memory = MemoryStore::open(&config.memory)?;
    memory.purge_stale(chrono::Duration::days(i64::from(config.memory.decay_days)))?;

    let mut registry = ToolRegistry::new(config.agent.tool_timeout);
    registry.register_all(system_tools(&config.tools))?;
    registry.register_all(web_tools()?)?;
    registry.register_all(memory_tools(&memory))?;
    let mcp = McpManager::start(&config.mcp, &mut registry).await;

    let provider = Arc::new(OpenAiCompatProvider::new(&config.llm)?);
    let engine = ReasoningEngine::new(provider, config.agent.name.clone(), config.llm.timeout)
        .with_instructions(config.llm.system_prompt.clone());

    tracing::info!(
        model = %config.llm.model,
        tools = registry.len(),
        protocol_servers = mcp.len(),
        "agent ready"
    );

    let orchestrator = Orchestrator::new(Arc::new(registry), engine, memory, config.agent.clone());
    Ok((orchestrator, mcp))
}

/// Text REPL; Ctrl-C interrupts the running turn, or exits at the prompt
async fn chat(config: &Config) -> anyhow::Result<()> {
    let (mut orchestrator, _mcp) = build_orchestrator(config).await?;
    let name = config.agent.name.clone();

    // One listener for the whole session
    let interrupter = Arc::new(Interrupter::new());
    let signals = tokio::spawn({
        let interrupter = interrupter.clone();
        async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if interrupter.interrupt() == Interrupted::Shutdown {
                    break;
                }
            }
        }
    });

    println!("{name} is listening. Type /reset to start over, /quit to exit.");
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("you> ");
        std::io::stdout().flush()?;

        let next = tokio::select! {
            () = interrupter.shutdown().cancelled() => {
                println!();
                break;
            }
            next = lines.next_line() => next?,
        };
        let Some(line) = next else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" | "/exit" => break,
            "/reset" => {
                orchestrator.end_session();
                println!("(session cleared)");
                continue;
            }
            _ => {}
        }

        let cancel = interrupter.begin_turn();
        let report = orchestrator.run_turn(line, &cancel).await;
        interrupter.end_turn();

        if report.outcome == TurnOutcome::Interrupted {
            println!("(interrupted)");
        } else {
            println!("{}> {}", name.to_lowercase(), report.reply);
        }
    }

    signals.abort();
    orchestrator.end_session();
    Ok(())
}

/// Hands-free session on the default microphone and speaker
async fn voice(config: &Config) -> anyhow::Result<()> {
    let (orchestrator, _mcp) = build_orchestrator(config).await?;

    let transcriber = Arc::new(HttpTranscriber::new(&config.voice)?);
    let synthesizer = Arc::new(HttpSynthesizer::new(&config.voice)?);
    let speech = SpeechLoop::start(
        Box::new(MicrophoneSource::open()?),
        Box::new(SpeakerSink::open()?),
        UtteranceDetector::default(),
    );

    let mut session = VoiceSession::new(orchestrator, speech, transcriber, synthesizer, &config.voice)?;

    match &config.voice.wake_word {
        Some(ww) => tracing::info!("{} ready - say \"{ww}\"", config.agent.name),
        None => tracing::info!("{} ready (no wake word configured)", config.agent.name),
    }

    tokio::select! {
        () = session.run() => {}
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
    }

    Ok(())
}

fn memory(config: &Config, action: MemoryCommand) -> anyhow::Result<()> {
    let store = MemoryStore::open(&config.memory)?;

    match action {
        MemoryCommand::Get { key } => match store.get(&normalize_key(&key))? {
            Some(fact) => println!("{}: {}", fact.key, fact.value),
            None => println!("(no fact named {key})"),
        },
        MemoryCommand::Put { key, value } => {
            let key = normalize_key(&key);
            anyhow::ensure!(!key.is_empty(), "fact key must contain letters or digits");
            let fact = store.put(&key, &value, None)?;
            println!("stored {}", fact.key);
        }
        MemoryCommand::Search { query, limit } => {
            for fact in store.search(&query, limit)? {
                println!("{}: {}", fact.key, fact.value);
            }
        }
        MemoryCommand::Forget { key } => {
            if store.forget(&normalize_key(&key))? {
                println!("forgot {key}");
            } else {
                println!("(no fact named {key})");
            }
        }
        MemoryCommand::List => {
            let facts = store.list()?;
            if facts.is_empty() {
                println!("(memory is empty)");
            }
            for fact in facts {
                println!(
                    "{}: {}  [updated {}]",
                    fact.key,
                    fact.value,
                    fact.updated_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        MemoryCommand::Episodes { limit } => {
            for episode in store.recent_episodes(limit)? {
                println!(
                    "{} {} {:?}: {}",
                    episode.at.format("%Y-%m-%d %H:%M:%S"),
                    episode.tool,
                    episode.outcome,
                    episode.summary
                );
            }
        }
        MemoryCommand::Clear { yes } => {
            if !yes {
                anyhow::bail!("refusing to clear memory without --yes");
            }
            let n = store.clear()?;
            println!("removed {n} facts");
        }
    }

    Ok(())
}

async fn list_tools(config: &Config) -> anyhow::Result<()> {
    let (orchestrator, _mcp) = build_orchestrator(config).await?;

    for tool in orchestrator.registry().descriptors() {
        println!("{:<32} {:<7} {}", tool.name, format!("{:?}", tool.kind), tool.description);
    }

    Ok(())
}

/// Test microphone input
async fn test_mic(duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut source = MicrophoneSource::open()?;
    println!("Sample rate: {SAMPLE_RATE} Hz");
    println!("---");

    for i in 0..duration {
        let mut second = Vec::with_capacity(SAMPLE_RATE as usize);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while let Ok(Some(frame)) = tokio::time::timeout_at(deadline, source.next_frame()).await {
            second.extend(frame);
        }

        let energy = rms(&second);
        let peak = second.iter().copied().map(f32::abs).fold(0.0f32, f32::max);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!("[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]", i + 1, energy, peak, meter);
    }

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Test speaker output with a sine wave
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let sample_rate = 24_000_u32;
    let frequency = 440.0_f32;
    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..sample_rate * 2)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
        })
        .collect();

    play(Pcm::new(samples, sample_rate)).await?;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}

/// Test speech synthesis through the configured endpoint
async fn test_tts(config: &Config, text: &str) -> anyhow::Result<()> {
    println!("Testing TTS with text: \"{text}\"\n");

    let synthesizer = HttpSynthesizer::new(&config.voice)?;
    println!("Synthesizing speech via {}...", config.voice.tts_base_url);
    let pcm = synthesizer.synthesize(text).await?;
    println!(
        "Got {} samples at {} Hz ({:.1}s)",
        pcm.samples.len(),
        pcm.sample_rate,
        pcm.duration().as_secs_f32()
    );

    play(pcm).await?;

    println!("\n---");
    println!("If you heard the speech, TTS is working!");

    Ok(())
}

async fn play(pcm: Pcm) -> anyhow::Result<()> {
    let mut sink = SpeakerSink::open()?;
    let samples = arc_agent::voice::resample(&pcm.samples, pcm.sample_rate, sink.sample_rate())?;
    println!("Playing {} samples at {} Hz...", samples.len(), sink.sample_rate());

    for chunk in samples.chunks(1024) {
        sink.write(chunk).await?;
    }
    sink.drain().await?;
    Ok(())
}
