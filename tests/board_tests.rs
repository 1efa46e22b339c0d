use gevcu_ext::board::SimBoard;
use gevcu_ext::can::{CanBus, CanFrame};
use gevcu_ext::config::*;
use gevcu_ext::device::{DeviceId, MessageTarget};
use gevcu_ext::devices::*;
use gevcu_ext::io::DigitalIo;
use gevcu_ext::prefs::{DeviceTable, MemoryStore};
use gevcu_ext::status::SystemState;

fn status_frame(state: SystemState, outputs: &[Output]) -> CanFrame {
    let word = outputs.iter().fold(0u16, |word, output| word | output.bit()).to_be_bytes();
    CanFrame::new(CAN_ID_GEVCU_STATUS, &[0, 0, word[0], word[1], state as u8, 0, 0, 0])
}

fn board_with_store(store: MemoryStore) -> SimBoard {
    let mut board = SimBoard::with_store(BoardConfig::default(), store);
    board.add_device(Box::new(Heartbeat::new())).unwrap();
    board.add_device(Box::new(CanIo::new())).unwrap();
    board
        .add_device(Box::new(TemperatureMonitor::new(SimulatedProbes::new(&[20.0, 30.0]))))
        .unwrap();
    board
}

fn started_board() -> SimBoard {
    let mut board = board_with_store(MemoryStore::new());
    board.start().unwrap();
    board
}

fn receive(board: &mut SimBoard, frame: CanFrame) {
    assert!(board.can_mut(CanBus::Ev).driver_mut().inject(frame));
    board.process();
}

fn can_io(board: &SimBoard) -> &CanIo {
    board.device_as::<CanIo>(DeviceId::CAN_IO).unwrap()
}

/// Contactor and relay outputs are active low.
fn energized(board: &SimBoard, pin: u8) -> bool {
    !board.io().read(pin)
}

#[test]
fn test_startup_then_illegal_jump_to_running() {
    let mut board = started_board();
    assert_eq!(board.system_state(), SystemState::Init);

    assert_eq!(board.set_system_state(SystemState::Running), SystemState::Error);
    assert_eq!(board.telemetry().status.rejected, 1);

    // the local error reaches CAN I/O, which drops everything
    assert_eq!(can_io(&board).fault_reason(), Some(FaultReason::LocalError));
    assert!(!board.can(CanBus::Ev).subscriptions().iter().any(|s| s.observer == DeviceId::CAN_IO));

    assert_eq!(board.set_system_state(SystemState::Init), SystemState::Init);
}

#[test]
fn test_legal_path_to_running() {
    let mut board = started_board();
    for state in [
        SystemState::PreCharge,
        SystemState::PreCharged,
        SystemState::Ready,
        SystemState::Running,
    ] {
        assert_eq!(board.set_system_state(state), state);
    }
    assert!(can_io(&board).passed_pre_charge());
    assert!(!can_io(&board).is_faulted());
}

#[test]
fn test_running_report_before_pre_charge_never_closes_contactor() {
    let mut board = started_board();
    receive(&mut board, status_frame(SystemState::Running, &[Output::MainContactor, Output::EnableMotor]));

    let can_io = can_io(&board);
    assert!(can_io.is_faulted());
    assert_eq!(can_io.fault_reason(), Some(FaultReason::PreChargeSkipped { remote_state: 8 }));
    assert!(!energized(&board, MAIN_CONTACTOR_RELAY_OUTPUT));
    assert!(!energized(&board, ENABLE_RELAY_OUTPUT));
    assert_eq!(board.system_state(), SystemState::Error);
}

#[test]
fn test_pre_charge_then_contactors() {
    let mut board = started_board();
    receive(&mut board, status_frame(SystemState::PreCharge, &[Output::PreChargeRelay]));
    assert!(energized(&board, PRECHARGE_RELAY_OUTPUT));
    assert!(!energized(&board, MAIN_CONTACTOR_RELAY_OUTPUT));

    receive(
        &mut board,
        status_frame(SystemState::Running, &[Output::MainContactor, Output::SecondaryContactor, Output::EnableMotor]),
    );
    assert!(!energized(&board, PRECHARGE_RELAY_OUTPUT));
    assert!(energized(&board, MAIN_CONTACTOR_RELAY_OUTPUT));
    assert!(energized(&board, SECONDARY_CONTACTOR_RELAY_OUTPUT));
    assert!(energized(&board, ENABLE_RELAY_OUTPUT));
    assert!(!can_io(&board).is_faulted());
}

#[test]
fn test_remote_error_releases_outputs() {
    let mut board = started_board();
    receive(&mut board, status_frame(SystemState::PreCharge, &[Output::PreChargeRelay]));
    receive(&mut board, status_frame(SystemState::Error, &[Output::PreChargeRelay]));

    assert_eq!(can_io(&board).fault_reason(), Some(FaultReason::RemoteError));
    assert!(!energized(&board, PRECHARGE_RELAY_OUTPUT));
    assert_eq!(board.system_state(), SystemState::Error);
}

#[test]
fn test_moved_contactor_pin_is_released_on_fault() {
    let mut board = started_board();
    receive(&mut board, status_frame(SystemState::PreCharge, &[Output::PreChargeRelay]));
    receive(&mut board, status_frame(SystemState::Running, &[Output::MainContactor]));
    assert!(energized(&board, MAIN_CONTACTOR_RELAY_OUTPUT));

    assert!(board.set_parameter(MessageTarget::by_id(DeviceId::CAN_IO), "MRELAY", "9"));
    receive(&mut board, status_frame(SystemState::Error, &[Output::MainContactor]));

    assert_eq!(can_io(&board).fault_reason(), Some(FaultReason::RemoteError));
    assert_eq!(board.system_state(), SystemState::Error);
    assert!(!energized(&board, MAIN_CONTACTOR_RELAY_OUTPUT));
}

#[test]
fn test_warm_reset_requires_new_pre_charge() {
    let mut board = started_board();
    receive(&mut board, status_frame(SystemState::PreCharge, &[Output::PreChargeRelay]));
    receive(&mut board, status_frame(SystemState::Running, &[Output::MainContactor]));
    assert!(energized(&board, MAIN_CONTACTOR_RELAY_OUTPUT));

    board.restart().unwrap();
    assert_eq!(board.system_state(), SystemState::Init);
    assert!(!energized(&board, MAIN_CONTACTOR_RELAY_OUTPUT));

    receive(&mut board, status_frame(SystemState::Running, &[Output::MainContactor]));
    assert_eq!(can_io(&board).fault_reason(), Some(FaultReason::PreChargeSkipped { remote_state: 8 }));
    assert_eq!(board.system_state(), SystemState::Error);
    assert!(!energized(&board, MAIN_CONTACTOR_RELAY_OUTPUT));
}

#[test]
fn test_silent_gevcu_faults_after_timeout() {
    let mut board = started_board();
    board.run_for(1_000_000, 200_000);
    assert!(!can_io(&board).is_faulted());

    board.run_for(200_000, 200_000);
    assert_eq!(can_io(&board).fault_reason(), Some(FaultReason::MessageTimeout { silent_ms: 1200 }));
    assert_eq!(board.system_state(), SystemState::Error);
    assert!(!board.ticks().is_attached(DeviceId::CAN_IO));
}

#[test]
fn test_regular_status_keeps_can_io_alive() {
    let mut board = started_board();
    for _ in 0..30 {
        receive(&mut board, status_frame(SystemState::Init, &[]));
        board.run_for(100_000, 100_000);
    }
    assert!(!can_io(&board).is_faulted());
    assert_eq!(can_io(&board).status().status_frames, 30);
    assert_eq!(board.system_state(), SystemState::Init);
}

#[test]
fn test_periodic_frames_on_ev_bus() {
    let mut board = started_board();
    board.run_for(2_000_000, 100_000);

    let mut ids = Vec::new();
    while let Some(frame) = board.can_mut(CanBus::Ev).driver_mut().pop_transmitted() {
        ids.push(frame.id);
    }
    assert_eq!(ids, vec![CAN_ID_GEVCU_EXT_TEMPERATURE]);

    let temperature = board.device_as::<TemperatureMonitor<SimulatedProbes>>(DeviceId::TEMPERATURE).unwrap();
    assert_eq!(temperature.maximum(), Some(30.0));
}

#[test]
fn test_device_table_survives_power_cycle() {
    let mut board = started_board();
    board.disable_device(DeviceId::TEMPERATURE).unwrap();
    assert!(!board.ticks().is_attached(DeviceId::TEMPERATURE));

    let snapshot = board.store().to_json().unwrap();
    let table = DeviceTable::load(board.store()).unwrap();
    assert_eq!(table.is_enabled(DeviceId::TEMPERATURE), Some(false));

    let mut rebooted = board_with_store(MemoryStore::from_json(&snapshot).unwrap());
    rebooted.start().unwrap();
    let temperature = rebooted.manager().get_device_by_id(DeviceId::TEMPERATURE).unwrap();
    assert!(!temperature.is_enabled());
    assert!(!temperature.is_ready());
    assert!(rebooted.ticks().is_attached(DeviceId::HEARTBEAT));

    rebooted.enable_device(DeviceId::TEMPERATURE).unwrap();
    assert!(rebooted.ticks().is_attached(DeviceId::TEMPERATURE));
}

#[test]
fn test_parameters_are_persisted() {
    let mut board = started_board();
    assert!(board.set_parameter(MessageTarget::by_id(DeviceId::CAN_IO), "COOLFAN", "9"));
    assert_eq!(can_io(&board).config().pin(Output::CoolingFan), 9);

    let snapshot = board.store().to_json().unwrap();
    let mut rebooted = board_with_store(MemoryStore::from_json(&snapshot).unwrap());
    rebooted.start().unwrap();
    assert_eq!(can_io(&rebooted).config().pin(Output::CoolingFan), 9);
}

#[test]
fn test_telemetry_serializes() {
    let mut board = started_board();
    board.run_for(400_000, 100_000);

    let json = serde_json::to_value(board.telemetry()).unwrap();
    assert_eq!(json["system_state"], "Init");
    assert_eq!(json["uptime_ms"], 400);
    assert_eq!(json["devices"].as_array().unwrap().len(), 3);
}
