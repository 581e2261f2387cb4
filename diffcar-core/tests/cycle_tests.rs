//! End-to-end command cycles against a recording drive.

use diffcar_core::utils::connection::{ChannelError, CommandChannel, Opcode, Wait};
use diffcar_core::utils::controllers::{
    drive::{share, Actuator, Direction, SharedDrive},
    Component, CompletionSignal, CompletionTimer, MotorController, MotorFault, MotorState,
    TimerError, Vehicle, VehicleConfig, VehicleError,
};
use diffcar_core::utils::math::speed::SpeedLevels;
use embassy_futures::{
    block_on,
    select::{select, Either},
};
use embassy_time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Event {
    Direction(Direction),
    Speed { duty_cycle: f32, ratio: f32 },
}

/// Drive double that timestamps every call.
#[derive(Default)]
struct RecordingDrive {
    events: Vec<(Instant, Event)>,
    refuse_speed: bool,
    /// Stop writes to reject before accepting them again.
    refuse_stops: usize,
}

impl Actuator for RecordingDrive {
    type Error = &'static str;

    fn set_direction(
        &mut self,
        direction: Direction,
    ) -> Result<(), Self::Error> {
        self.events.push((Instant::now(), Event::Direction(direction)));
        if direction == Direction::Stop && self.refuse_stops > 0 {
            self.refuse_stops -= 1;
            return Err("stop line stuck");
        }
        Ok(())
    }

    fn set_speed(
        &mut self,
        duty_cycle: f32,
        ratio: f32,
    ) -> Result<SpeedLevels, Self::Error> {
        if self.refuse_speed {
            return Err("pwm offline");
        }
        self.events
            .push((Instant::now(), Event::Speed { duty_cycle, ratio }));
        Ok(SpeedLevels::default())
    }
}

fn events(drive: &SharedDrive<RecordingDrive>) -> Vec<(Instant, Event)> {
    drive.lock(|d| d.borrow().events.clone())
}

fn kinds(drive: &SharedDrive<RecordingDrive>) -> Vec<Event> {
    events(drive).into_iter().map(|(_, e)| e).collect()
}

fn config(
    duty_cycle: f32,
    wheels_ratio: f32,
) -> VehicleConfig {
    VehicleConfig {
        settle_ms: 0,
        stop_grace_ms: 100,
        ..VehicleConfig::new(duty_cycle, wheels_ratio)
    }
}

/// Run `body` while the alarm loop of `timer` runs alongside it.
fn with_alarm<T>(
    timer: &CompletionTimer<'_, RecordingDrive>,
    body: impl core::future::Future<Output = T>,
) -> T {
    block_on(async {
        match select(timer.run(), body).await {
            Either::First(_) => unreachable!("alarm loop never returns"),
            Either::Second(out) => out,
        }
    })
}

const FORWARD: Event = Event::Direction(Direction::Forward);
const STOP: Event = Event::Direction(Direction::Stop);

#[test]
fn test_single_command_acknowledged_after_duration() {
    let channel = CommandChannel::new();
    let vehicle = Vehicle::new(config(0.5, 1.0))
        .unwrap()
        .with_component(Component::Motor, &channel)
        .unwrap();
    let drive = share(RecordingDrive::default());
    let signal = CompletionSignal::new();
    let timer = CompletionTimer::new(&drive, &signal);
    let mut motor = MotorController::new(&vehicle, &timer).unwrap();

    channel.request(1000).unwrap();
    let start = Instant::now();
    let (executed, reply, elapsed) = with_alarm(&timer, async {
        let executed = motor.cycle().await;
        let elapsed = start.elapsed();
        let reply = channel
            .next_reply(Wait::For(Duration::from_millis(10)))
            .await;
        (executed, reply, elapsed)
    });

    assert_eq!(executed, Ok(1000));
    assert_eq!(reply, Ok(Opcode::Finished));
    assert!(elapsed >= Duration::from_millis(1000));
    assert!(!signal.is_raised());
    assert!(channel.outbound().is_empty());
    assert_eq!(motor.state(), MotorState::Idle);
    assert_eq!(motor.completed(), 1);

    let log = events(&drive);
    assert_eq!(
        log.iter().map(|(_, e)| *e).collect::<Vec<_>>(),
        vec![
            FORWARD,
            Event::Speed {
                duty_cycle: 0.5,
                ratio: 1.0
            },
            STOP,
        ]
    );
    assert!(log[2].0 - start >= Duration::from_millis(1000));
}

#[test]
fn test_second_command_waits_for_first_acknowledgement() {
    let channel = CommandChannel::new();
    let vehicle = Vehicle::new(config(0.8, 1.2))
        .unwrap()
        .with_component(Component::Motor, &channel)
        .unwrap();
    let drive = share(RecordingDrive::default());
    let signal = CompletionSignal::new();
    let timer = CompletionTimer::new(&drive, &signal);
    let mut motor = MotorController::new(&vehicle, &timer).unwrap();

    channel.request(60).unwrap();
    channel.request(20).unwrap();

    let first = with_alarm(&timer, motor.cycle());
    assert_eq!(first, Ok(60));
    assert_eq!(channel.inbound().len(), 1);
    assert_eq!(channel.outbound().len(), 1);
    assert_eq!(kinds(&drive).iter().filter(|e| **e == FORWARD).count(), 1);
    assert!(!signal.is_raised());

    let second = with_alarm(&timer, motor.cycle());
    assert_eq!(second, Ok(20));

    let log = events(&drive);
    let seq: Vec<Event> = log.iter().map(|(_, e)| *e).collect();
    assert_eq!(seq.len(), 6);
    assert_eq!(seq[2], STOP);
    assert_eq!(seq[3], FORWARD);
    assert!(log[3].0 >= log[2].0);

    let replies = block_on(async {
        [
            channel.next_reply(Wait::For(Duration::from_millis(10))).await,
            channel.next_reply(Wait::For(Duration::from_millis(10))).await,
        ]
    });
    assert_eq!(replies, [Ok(Opcode::Finished), Ok(Opcode::Finished)]);
}

#[test]
fn test_zero_duration_completes_full_cycle() {
    let channel = CommandChannel::new();
    let vehicle = Vehicle::new(config(0.3, 0.9))
        .unwrap()
        .with_component(Component::Motor, &channel)
        .unwrap();
    let drive = share(RecordingDrive::default());
    let signal = CompletionSignal::new();
    let timer = CompletionTimer::new(&drive, &signal);
    let mut motor = MotorController::new(&vehicle, &timer).unwrap();

    channel.request(0).unwrap();
    let executed = with_alarm(&timer, motor.cycle());

    assert_eq!(executed, Ok(0));
    assert_eq!(motor.state(), MotorState::Idle);
    assert!(!timer.is_armed());
    assert!(!signal.is_raised());
    assert_eq!(kinds(&drive).last(), Some(&STOP));
    let reply = block_on(channel.next_reply(Wait::For(Duration::from_millis(10))));
    assert_eq!(reply, Ok(Opcode::Finished));
}

#[test]
fn test_signal_clear_between_cycles() {
    let channel = CommandChannel::new();
    let vehicle = Vehicle::new(config(1.0, 1.0))
        .unwrap()
        .with_component(Component::Motor, &channel)
        .unwrap();
    let drive = share(RecordingDrive::default());
    let signal = CompletionSignal::new();
    let timer = CompletionTimer::new(&drive, &signal);
    let mut motor = MotorController::new(&vehicle, &timer).unwrap();

    for duration in [5, 0, 15, 1, 10] {
        channel.request(duration).unwrap();
        assert_eq!(with_alarm(&timer, motor.cycle()), Ok(duration));
        assert_eq!(motor.state(), MotorState::Idle);
        assert!(!signal.is_raised());
        channel.outbound().clear();
    }
    assert_eq!(motor.completed(), 5);
    assert_eq!(motor.faults(), 0);
}

#[test]
fn test_missing_alarm_forces_stop_and_reports_fault() {
    let channel = CommandChannel::new();
    let mut cfg = config(0.5, 1.0);
    cfg.stop_grace_ms = 20;
    let vehicle = Vehicle::new(cfg)
        .unwrap()
        .with_component(Component::Motor, &channel)
        .unwrap();
    let drive = share(RecordingDrive::default());
    let signal = CompletionSignal::new();
    let timer = CompletionTimer::new(&drive, &signal);
    let mut motor = MotorController::new(&vehicle, &timer).unwrap();

    // No alarm loop: the stop alarm is never delivered.
    channel.request(10).unwrap();
    let start = Instant::now();
    let executed = block_on(motor.cycle());

    assert_eq!(
        executed,
        Err(MotorFault::TimerNotDelivered { duration_ms: 10 })
    );
    assert!(start.elapsed() >= Duration::from_millis(30));
    assert_eq!(kinds(&drive).last(), Some(&STOP));
    assert!(!timer.is_armed());
    assert!(!signal.is_raised());
    assert_eq!(motor.faults(), 1);
    assert_eq!(
        block_on(channel.next_reply(Wait::For(Duration::from_millis(10)))),
        Ok(Opcode::Fault)
    );

    // The next command runs normally once the alarm is serviced again.
    channel.request(5).unwrap();
    assert_eq!(with_alarm(&timer, motor.cycle()), Ok(5));
    assert_eq!(
        block_on(channel.next_reply(Wait::For(Duration::from_millis(10)))),
        Ok(Opcode::Finished)
    );
}

#[test]
fn test_drive_failure_stops_and_reports_fault() {
    let channel = CommandChannel::new();
    let vehicle = Vehicle::new(config(0.5, 1.0))
        .unwrap()
        .with_component(Component::Motor, &channel)
        .unwrap();
    let drive = share(RecordingDrive {
        refuse_speed: true,
        ..Default::default()
    });
    let signal = CompletionSignal::new();
    let timer = CompletionTimer::new(&drive, &signal);
    let mut motor = MotorController::new(&vehicle, &timer).unwrap();

    channel.request(50).unwrap();
    let executed = with_alarm(&timer, motor.cycle());

    assert_eq!(executed, Err(MotorFault::Drive));
    assert_eq!(kinds(&drive), vec![FORWARD, STOP]);
    assert!(!timer.is_armed());
    assert_eq!(
        block_on(channel.next_reply(Wait::For(Duration::from_millis(10)))),
        Ok(Opcode::Fault)
    );
}

#[test]
fn test_failed_alarm_stop_is_retried_before_acknowledging() {
    let channel = CommandChannel::new();
    let vehicle = Vehicle::new(config(0.5, 1.0))
        .unwrap()
        .with_component(Component::Motor, &channel)
        .unwrap();
    let drive = share(RecordingDrive {
        refuse_stops: 1,
        ..Default::default()
    });
    let signal = CompletionSignal::new();
    let timer = CompletionTimer::new(&drive, &signal);
    let mut motor = MotorController::new(&vehicle, &timer).unwrap();

    channel.request(10).unwrap();
    assert_eq!(with_alarm(&timer, motor.cycle()), Ok(10));

    assert_eq!(
        kinds(&drive),
        vec![
            FORWARD,
            Event::Speed {
                duty_cycle: 0.5,
                ratio: 1.0
            },
            STOP,
            STOP,
        ]
    );
    assert!(!timer.take_stop_fault());
    assert!(!signal.is_raised());
    assert_eq!(motor.faults(), 0);
    assert_eq!(
        block_on(channel.next_reply(Wait::For(Duration::from_millis(10)))),
        Ok(Opcode::Finished)
    );
}

#[test]
fn test_receive_times_out_on_empty_lane() {
    let channel = CommandChannel::new();

    let start = Instant::now();
    let mut buf = [0u8; 8];
    let n = block_on(
        channel
            .inbound()
            .receive(&mut buf, Wait::For(Duration::from_millis(20))),
    );
    assert_eq!(n, 0);
    assert!(start.elapsed() >= Duration::from_millis(20));

    assert_eq!(
        block_on(channel.next_reply(Wait::For(Duration::from_millis(10)))),
        Err(ChannelError::SizeMismatch {
            expected: 3,
            received: 0
        })
    );
}

#[test]
fn test_malformed_frame_is_skipped_without_reply() {
    let channel = CommandChannel::new();
    let vehicle = Vehicle::new(config(0.5, 1.0))
        .unwrap()
        .with_component(Component::Motor, &channel)
        .unwrap();
    let drive = share(RecordingDrive::default());
    let signal = CompletionSignal::new();
    let timer = CompletionTimer::new(&drive, &signal);
    let mut motor = MotorController::new(&vehicle, &timer).unwrap();

    channel.inbound().send(&[0x01, 0x02, 0x03]).unwrap();
    let executed = block_on(motor.cycle());

    assert_eq!(
        executed,
        Err(MotorFault::Channel(ChannelError::SizeMismatch {
            expected: 2,
            received: 3
        }))
    );
    assert!(kinds(&drive).is_empty());
    assert!(channel.outbound().is_empty());
    assert_eq!(motor.state(), MotorState::Idle);
}

#[test]
fn test_acknowledgement_dropped_when_outbound_full() {
    let channel = CommandChannel::new();
    let vehicle = Vehicle::new(config(0.5, 1.0))
        .unwrap()
        .with_component(Component::Motor, &channel)
        .unwrap();
    let drive = share(RecordingDrive::default());
    let signal = CompletionSignal::new();
    let timer = CompletionTimer::new(&drive, &signal);
    let mut motor = MotorController::new(&vehicle, &timer).unwrap();

    while channel.reply(Opcode::Finished).is_ok() {}
    let queued = channel.outbound().len();

    channel.request(5).unwrap();
    assert_eq!(with_alarm(&timer, motor.cycle()), Ok(5));
    assert_eq!(channel.outbound().len(), queued);
    assert!(!signal.is_raised());
}

#[test]
fn test_timer_rejects_second_arm_and_expire_stops_drive() {
    let drive = share(RecordingDrive::default());
    let signal = CompletionSignal::new();
    let timer = CompletionTimer::new(&drive, &signal);

    timer.arm(Duration::from_millis(500)).unwrap();
    assert_eq!(
        timer.arm(Duration::from_millis(10)),
        Err(TimerError::AlreadyArmed)
    );

    timer.expire();
    assert!(signal.is_raised());
    assert!(!timer.is_armed());
    assert!(!timer.take_stop_fault());
    assert_eq!(kinds(&drive), vec![STOP]);

    signal.reset();
    assert!(!signal.is_raised());
    assert!(timer.arm(Duration::from_millis(10)).is_ok());
    assert!(timer.disarm());
}

#[test]
fn test_concurrent_arm_admits_one_caller() {
    let drive = share(RecordingDrive::default());
    let signal = CompletionSignal::new();
    let timer = CompletionTimer::new(&drive, &signal);
    let barrier = std::sync::Barrier::new(8);

    let accepted = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    timer.arm(Duration::from_millis(100)).is_ok()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count()
    });

    assert_eq!(accepted, 1);
    assert!(timer.is_armed());
    assert!(timer.disarm());
    assert!(!timer.is_armed());
}

#[test]
fn test_motor_requires_channel() {
    let vehicle = Vehicle::new(config(0.5, 1.0)).unwrap();
    let drive = share(RecordingDrive::default());
    let signal = CompletionSignal::new();
    let timer = CompletionTimer::new(&drive, &signal);

    assert!(matches!(
        MotorController::new(&vehicle, &timer),
        Err(MotorFault::MissingChannel(Component::Motor))
    ));
}

#[test]
fn test_vehicle_rejects_out_of_range_config() {
    assert_eq!(
        Vehicle::new(VehicleConfig::new(1.2, 1.0)).err(),
        Some(VehicleError::DutyCycleOutOfRange)
    );
    assert_eq!(
        Vehicle::new(VehicleConfig::new(-0.1, 1.0)).err(),
        Some(VehicleError::DutyCycleOutOfRange)
    );
    assert_eq!(
        Vehicle::new(VehicleConfig::new(0.5, 0.0)).err(),
        Some(VehicleError::InvalidWheelsRatio)
    );
    assert_eq!(
        Vehicle::new(VehicleConfig::new(0.5, f32::NAN)).err(),
        Some(VehicleError::InvalidWheelsRatio)
    );

    let mut no_grace = VehicleConfig::new(0.5, 1.0);
    no_grace.stop_grace_ms = 0;
    assert_eq!(
        Vehicle::new(no_grace).err(),
        Some(VehicleError::ZeroStopGrace)
    );
    no_grace.stop_grace_ms = 1;
    assert!(Vehicle::new(no_grace).is_ok());
}

#[test]
fn test_vehicle_config_from_json_uses_defaults() {
    let cfg: VehicleConfig =
        serde_json::from_str(r#"{"duty_cycle":0.5,"wheels_ratio":1.05}"#).unwrap();
    assert_eq!(cfg, VehicleConfig::new(0.5, 1.05));

    let channel = CommandChannel::new();
    let vehicle = Vehicle::new(cfg)
        .unwrap()
        .with_component(Component::Motor, &channel)
        .unwrap();
    assert!(vehicle.channel(Component::Motor).is_some());
    assert_eq!(vehicle.duty_cycle(), 0.5);
    assert_eq!(vehicle.wheels_ratio(), 1.05);
}
