use clap::{App, Arg};
use colored::*;
use gevcu_ext::board::SimBoard;
use gevcu_ext::can::{CanBus, CanFrame};
use gevcu_ext::config::{BoardConfig, CAN_ID_GEVCU_ANALOG_IO, CAN_ID_GEVCU_STATUS, VERSION};
use gevcu_ext::device::DeviceId;
use gevcu_ext::devices::{CanIo, FlowMeter, Heartbeat, Output, PulseCounter, SimulatedProbes, TemperatureMonitor};
use gevcu_ext::prefs::MemoryStore;
use gevcu_ext::status::SystemState;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, error, info, warn, Level};

const GEVCU_STATUS_PERIOD_MS: u64 = 100;
/// About 4.5 litres per minute with the stock sensor.
const HEATER_PULSES_PER_SEC: u64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scenario {
    /// Init, pre-charge, ready, running.
    Normal,
    /// The GEVCU jumps to running without pre-charging.
    SkipPreCharge,
    /// The GEVCU falls silent after reaching running.
    Stale,
}

impl Scenario {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "normal" => Some(Scenario::Normal),
            "skip-precharge" => Some(Scenario::SkipPreCharge),
            "stale" => Some(Scenario::Stale),
            _ => None,
        }
    }
}

/// Plays the GEVCU side of the EV bus.
struct GevcuEmulator {
    scenario: Scenario,
    last_status_ms: Option<u64>,
}

impl GevcuEmulator {
    fn new(scenario: Scenario) -> Self {
        Self { scenario, last_status_ms: None }
    }

    fn state_at(&self, now_ms: u64) -> SystemState {
        match self.scenario {
            Scenario::SkipPreCharge => {
                if now_ms < 500 {
                    SystemState::Init
                } else {
                    SystemState::Running
                }
            }
            Scenario::Normal | Scenario::Stale => match now_ms {
                0..=299 => SystemState::Init,
                300..=1499 => SystemState::PreCharge,
                1500..=1999 => SystemState::PreCharged,
                2000..=2499 => SystemState::Ready,
                _ => SystemState::Running,
            },
        }
    }

    fn logic_io(state: SystemState) -> u16 {
        let outputs: &[Output] = match state {
            SystemState::PreCharge => &[Output::PreChargeRelay, Output::EnableDcDc],
            SystemState::PreCharged | SystemState::Ready => {
                &[Output::MainContactor, Output::SecondaryContactor, Output::EnableDcDc]
            }
            SystemState::Running => &[
                Output::MainContactor,
                Output::SecondaryContactor,
                Output::EnableDcDc,
                Output::EnableMotor,
                Output::CoolingPump,
            ],
            _ => &[],
        };
        outputs.iter().fold(0, |word, output| word | output.bit())
    }

    /// Frames due at `now_ms`.
    fn poll(&mut self, now_ms: u64) -> Option<[CanFrame; 2]> {
        if self.scenario == Scenario::Stale && now_ms >= 3000 {
            return None;
        }
        if let Some(last) = self.last_status_ms {
            if now_ms < last + GEVCU_STATUS_PERIOD_MS {
                return None;
            }
        }
        self.last_status_ms = Some(now_ms);

        let state = self.state_at(now_ms);
        let word = Self::logic_io(state).to_be_bytes();
        let status = CanFrame::new(CAN_ID_GEVCU_STATUS, &[0, 0, word[0], word[1], state as u8, 0, 0, 0]);

        let throttle = ((now_ms / 10) % 1024) as u16;
        let mut analog = [0u8; 8];
        analog[..2].copy_from_slice(&throttle.to_be_bytes());
        let analog = CanFrame::new(CAN_ID_GEVCU_ANALOG_IO, &analog);

        Some([status, analog])
    }
}

fn build_board(config: BoardConfig, store: MemoryStore, heater_pulses: &PulseCounter) -> SimBoard {
    let mut board = SimBoard::with_store(config, store);
    let devices: Vec<Box<dyn gevcu_ext::Device>> = vec![
        Box::new(Heartbeat::new()),
        Box::new(CanIo::new()),
        Box::new(TemperatureMonitor::new(SimulatedProbes::new(&[21.5, 24.0, 38.5]))),
        Box::new(FlowMeter::heater(heater_pulses.clone())),
        Box::new(FlowMeter::cooling(PulseCounter::new())),
    ];
    for device in devices {
        if let Err(e) = board.add_device(device) {
            warn!("Unable to register device: {}", e);
        }
    }
    board
}

fn state_label(state: SystemState) -> ColoredString {
    match state {
        SystemState::Error => state.as_str().red().bold(),
        SystemState::Running | SystemState::Ready => state.as_str().green().bold(),
        _ => state.as_str().yellow(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("gevcu-ext-sim")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Runs the CAN I/O extension board against a scripted GEVCU")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Board configuration (JSON)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("store")
                .short("s")
                .long("store")
                .value_name("FILE")
                .help("Persistent configuration snapshot, loaded at start and written back at exit")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("scenario")
                .long("scenario")
                .value_name("NAME")
                .help("GEVCU behaviour")
                .possible_values(&["normal", "skip-precharge", "stale"])
                .default_value("normal"),
        )
        .arg(
            Arg::with_name("duration")
                .short("d")
                .long("duration-ms")
                .value_name("MS")
                .help("Simulated time to run")
                .default_value("5000"),
        )
        .arg(
            Arg::with_name("step")
                .long("step-ms")
                .value_name("MS")
                .help("Main loop period")
                .default_value("10"),
        )
        .arg(
            Arg::with_name("log-level")
                .short("l")
                .long("log-level")
                .value_name("LEVEL")
                .possible_values(&["error", "warn", "info", "debug", "trace"])
                .default_value("info"),
        )
        .arg(Arg::with_name("realtime").long("realtime").help("Pace the main loop with the wall clock"))
        .arg(Arg::with_name("json").long("json").help("Print the final telemetry as JSON"))
        .get_matches();

    let level: Level = matches.value_of("log-level").unwrap_or("info").parse()?;
    tracing_subscriber::fmt().with_max_level(level).with_target(false).init();

    let config = match matches.value_of("config") {
        Some(path) => BoardConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => BoardConfig::default(),
    };
    let store = match matches.value_of("store") {
        Some(path) if std::path::Path::new(path).exists() => MemoryStore::from_json(&std::fs::read_to_string(path)?)?,
        _ => MemoryStore::new(),
    };
    let scenario = Scenario::parse(matches.value_of("scenario").unwrap_or("normal")).unwrap_or(Scenario::Normal);
    let duration_ms: u64 = matches.value_of("duration").unwrap_or("5000").parse()?;
    let step_ms: u64 = matches.value_of("step").unwrap_or("10").parse::<u64>()?.max(1);

    println!("{}", VERSION.bold());
    println!("{}", "=".repeat(VERSION.len()));

    let heater_pulses = PulseCounter::new();
    let mut board = build_board(config, store, &heater_pulses);
    board.start()?;

    let running = Arc::new(AtomicBool::new(true));
    let ctrl_c = Arc::clone(&running);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.store(false, Ordering::SeqCst);
        }
    });

    let mut gevcu = GevcuEmulator::new(scenario);
    let mut sent: BTreeMap<u32, u32> = BTreeMap::new();
    let mut interval = time::interval(Duration::from_millis(step_ms));
    let mut last_state = board.system_state();

    while board.now_ms() < duration_ms && running.load(Ordering::SeqCst) {
        if matches.is_present("realtime") {
            interval.tick().await;
        }

        if let Some(frames) = gevcu.poll(board.now_ms()) {
            let ev = board.can_mut(CanBus::Ev).driver_mut();
            for frame in &frames {
                if !ev.inject(*frame) {
                    debug!("Frame {:#x} not accepted by any mailbox", frame.id);
                }
            }
        }
        let now_ms = board.now_ms();
        let pulses = (now_ms + step_ms) * HEATER_PULSES_PER_SEC / 1000 - now_ms * HEATER_PULSES_PER_SEC / 1000;
        heater_pulses.add(pulses as u16);

        board.advance(step_ms * 1000);
        board.process();

        while let Some(frame) = board.can_mut(CanBus::Ev).driver_mut().pop_transmitted() {
            debug!("EV bus TX {:#x} {:02x?}", frame.id, frame.payload());
            *sent.entry(frame.id).or_default() += 1;
        }

        let state = board.system_state();
        if state != last_state {
            info!("System state: {} -> {}", last_state, state);
            last_state = state;
        }
    }

    println!();
    println!("Simulated time:  {} ms", board.now_ms());
    println!("System state:    {}", state_label(board.system_state()));
    match board.device_as::<CanIo>(DeviceId::CAN_IO) {
        Some(can_io) => {
            let status = can_io.status();
            let fault = match status.fault_reason {
                Some(reason) => format!("{:?}", reason).red().to_string(),
                None => "none".green().to_string(),
            };
            println!("CAN I/O fault:   {}", fault);
            println!("Pre-charged:     {}", status.passed_pre_charge);
            println!("Logic I/O:       {:#06x}", status.logic_io);
            let active: Vec<&str> =
                Output::ALL.iter().filter(|output| can_io.is_active(**output)).map(|output| output.param_key()).collect();
            println!("Active outputs:  {}", active.join(", "));
        }
        None => error!("CAN I/O device missing"),
    }
    for (id, count) in &sent {
        println!("Sent {:#05x}:      {} frames", id, count);
    }

    if matches.is_present("json") {
        println!("{}", serde_json::to_string_pretty(&board.telemetry())?);
    }

    if let Some(path) = matches.value_of("store") {
        std::fs::write(path, board.store().to_json()?)?;
        info!("Configuration written to {}", path);
    }

    Ok(())
}
