use clap::Parser;
use core::convert::Infallible;
use diffcar_core::mk_static;
use diffcar_core::utils::connection::{CommandChannel, Opcode, Wait, MOTOR_CHANNEL};
use diffcar_core::utils::controllers::{
    drive::share, CompletionSignal, CompletionTimer, Component, DifferentialDrive, MotorController,
    MotorFault, PwmChannel, PwmSlice, SharedDrive, Vehicle, VehicleConfig, VehicleError,
};
use diffcar_core::utils::Instant;
use embassy_executor::{Executor, SpawnToken, Spawner};
use embedded_hal::digital::{ErrorType, OutputPin};
use static_cell::StaticCell;
use std::fmt;
use tracing::{error, info, warn};

#[derive(Parser)]
#[clap(version = "1.0")]
struct Opts {
    /// Vehicle configuration as JSON, inline or a path to a file
    #[clap(long)]
    config: Option<String>,
    /// Fraction of full power, 0..=1
    #[clap(long)]
    duty_cycle: Option<f32>,
    /// Left/right power bias; 1.0 is balanced
    #[clap(long)]
    wheels_ratio: Option<f32>,
    /// Extra wait for the stop alarm before forcing a stop (ms)
    #[clap(long)]
    stop_grace_ms: Option<u32>,
    /// Pause between command cycles (ms)
    #[clap(long)]
    settle_ms: Option<u32>,
    /// Forward run to request, in ms; repeat for several commands
    #[clap(long = "duration", default_values_t = [1000u16])]
    durations: Vec<u16>,
    /// queue every command up front instead of waiting for each acknowledgement
    #[clap(long)]
    burst: bool,
}

#[derive(Debug)]
enum StartupError {
    Config(String),
    Vehicle(VehicleError),
    Drive(String),
    Motor(MotorFault),
}

impl fmt::Display for StartupError {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            StartupError::Config(e) => write!(f, "invalid configuration: {}", e),
            StartupError::Vehicle(e) => write!(f, "invalid vehicle: {}", e),
            StartupError::Drive(e) => write!(f, "drive configuration failed: {}", e),
            StartupError::Motor(e) => write!(f, "motor task setup failed: {}", e),
        }
    }
}

/// PWM slice that logs to console
struct SimSlice;

impl PwmSlice for SimSlice {
    type Error = Infallible;

    fn claim(&mut self) -> Result<(), Self::Error> {
        info!("PWM: ENA/ENB routed to slice");
        Ok(())
    }

    fn set_clock_divider(
        &mut self,
        divider: f32,
    ) -> Result<(), Self::Error> {
        info!("PWM: clock divider {}", divider);
        Ok(())
    }

    fn set_wrap(
        &mut self,
        wrap: u16,
    ) -> Result<(), Self::Error> {
        info!("PWM: wrap {}", wrap);
        Ok(())
    }

    fn set_channel_level(
        &mut self,
        channel: PwmChannel,
        level: u16,
    ) -> Result<(), Self::Error> {
        info!("PWM: channel {:?} level {}", channel, level);
        Ok(())
    }

    fn set_enabled(
        &mut self,
        enabled: bool,
    ) -> Result<(), Self::Error> {
        info!("PWM: enabled={}", enabled);
        Ok(())
    }
}

/// Direction line that logs to console
struct SimLine(&'static str);

impl ErrorType for SimLine {
    type Error = Infallible;
}

impl OutputPin for SimLine {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        tracing::debug!("{}: low", self.0);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        tracing::debug!("{}: high", self.0);
        Ok(())
    }
}

type SimDrive = DifferentialDrive<SimSlice, SimLine>;

#[embassy_executor::task]
async fn alarm_task(timer: &'static CompletionTimer<'static, SimDrive>) -> ! {
    timer.run().await
}

#[embassy_executor::task]
async fn drive_task(mut motor: MotorController<'static, SimDrive>) -> ! {
    motor.run().await
}

/// Wait for one acknowledgement; returns whether it reported a fault.
async fn await_reply(
    channel: &CommandChannel,
    start: Instant,
) -> bool {
    match channel.next_reply(Wait::Forever).await {
        Ok(Opcode::Finished) => {
            info!(elapsed_ms = start.elapsed().as_millis(), "FIN");
            false
        }
        Ok(Opcode::Fault) => {
            error!(elapsed_ms = start.elapsed().as_millis(), "FLT");
            true
        }
        Err(e) => {
            warn!("unreadable acknowledgement: {}", e);
            true
        }
    }
}

/// Send `durations` and collect their acknowledgements; returns the fault count.
///
/// In burst mode every command is queued up front and only the ones the
/// channel accepted are waited for.
async fn issue_commands(
    channel: &CommandChannel,
    durations: &[u16],
    burst: bool,
) -> usize {
    let start = Instant::now();
    let mut faults = 0;

    if burst {
        let mut queued = 0;
        for &duration_ms in durations {
            match channel.request(duration_ms) {
                Ok(()) => queued += 1,
                Err(e) => {
                    faults += 1;
                    warn!(duration_ms, "command not queued: {}", e);
                }
            }
        }
        for _ in 0..queued {
            if await_reply(channel, start).await {
                faults += 1;
            }
        }
    } else {
        for &duration_ms in durations {
            if let Err(e) = channel.request(duration_ms) {
                faults += 1;
                warn!(duration_ms, "command not queued: {}", e);
                continue;
            }
            if await_reply(channel, start).await {
                faults += 1;
            }
        }
    }
    faults
}

#[embassy_executor::task]
async fn command_task(
    channel: &'static CommandChannel,
    durations: Vec<u16>,
    burst: bool,
) {
    let faults = issue_commands(channel, &durations, burst).await;
    info!(commands = durations.len(), faults, "command source done");
    std::process::exit(if faults == 0 { 0 } else { 1 });
}

fn load_config(opts: &Opts) -> Result<VehicleConfig, StartupError> {
    let mut config = match &opts.config {
        Some(source) => {
            let text = match std::fs::read_to_string(source) {
                Ok(text) => text,
                Err(_) => source.clone(),
            };
            serde_json::from_str(&text).map_err(|e| StartupError::Config(e.to_string()))?
        }
        None => VehicleConfig::new(0.5, 1.0),
    };

    if let Some(duty_cycle) = opts.duty_cycle {
        config.duty_cycle = duty_cycle;
    }
    if let Some(wheels_ratio) = opts.wheels_ratio {
        config.wheels_ratio = wheels_ratio;
    }
    if let Some(stop_grace_ms) = opts.stop_grace_ms {
        config.stop_grace_ms = stop_grace_ms;
    }
    if let Some(settle_ms) = opts.settle_ms {
        config.settle_ms = settle_ms;
    }
    Ok(config)
}

fn setup(
    opts: &Opts,
) -> Result<
    (
        &'static CompletionTimer<'static, SimDrive>,
        MotorController<'static, SimDrive>,
    ),
    StartupError,
> {
    let config = load_config(opts)?;
    info!(?config, "vehicle configuration");

    let vehicle = Vehicle::new(config)
        .and_then(|v| v.with_component(Component::Motor, &MOTOR_CHANNEL))
        .map_err(StartupError::Vehicle)?;
    let vehicle: &'static Vehicle<'static> = mk_static!(Vehicle<'static>, vehicle);

    let lines = [
        SimLine("IN1"),
        SimLine("IN2"),
        SimLine("IN3"),
        SimLine("IN4"),
    ];
    let drive: &'static SharedDrive<SimDrive> =
        mk_static!(SharedDrive<SimDrive>, share(DifferentialDrive::new(SimSlice, lines)));
    drive
        .lock(|d| d.borrow_mut().configure())
        .map_err(|e| StartupError::Drive(e.to_string()))?;

    let signal: &'static CompletionSignal = mk_static!(CompletionSignal, CompletionSignal::new());
    let timer: &'static CompletionTimer<'static, SimDrive> = mk_static!(
        CompletionTimer<'static, SimDrive>,
        CompletionTimer::new(drive, signal)
    );
    let motor = MotorController::new(vehicle, timer).map_err(StartupError::Motor)?;

    Ok((timer, motor))
}

fn spawn<S>(
    spawner: &Spawner,
    token: SpawnToken<S>,
    name: &str,
) {
    if let Err(e) = spawner.spawn(token) {
        error!("failed to spawn {}: {:?}", name, e);
        std::process::exit(1);
    }
}

static EXECUTOR: StaticCell<Executor> = StaticCell::new();

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let opts: Opts = Opts::parse();
    let (timer, motor) = match setup(&opts) {
        Ok(parts) => parts,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let executor = EXECUTOR.init(Executor::new());
    executor.run(|spawner| {
        spawn(&spawner, alarm_task(timer), "alarm_task");
        spawn(&spawner, drive_task(motor), "drive_task");
        spawn(
            &spawner,
            command_task(&MOTOR_CHANNEL, opts.durations, opts.burst),
            "command_task",
        );
    });
}
