mod common;

use common::*;
use sdcard_fat32::{
    probe::{PartitionTypeMatch, SdCardError},
    SdCardConfig, SD_SECTOR_SIZE,
};

#[test]
fn init_reports_capacity_partition_and_registers() {
    let state = fake_card(card_image());
    let mut card = card_with(&state, SdCardConfig::default());
    let mut delay = NoDelay::default();
    let status = card.init(&mut delay).unwrap();

    assert_eq!(status.sector_count, CARD_SECTORS);
    assert_eq!(status.capacity_bytes, CARD_SECTORS as u64 * 512);
    assert_eq!(status.partition.first_sector, PARTITION_FIRST_SECTOR);
    assert_eq!(status.partition.sector_count, PARTITION_SECTORS);
    assert_eq!(status.partition.partition_type, 0x0C);
    assert_eq!(delay.total_ns, 250 * 1_000_000);

    let registers = card.registers().unwrap();
    assert_eq!(registers.csd_structure, 1);
    assert_eq!(registers.cid, CID);
    assert_eq!(registers.ocr, OCR);
    assert!(card.is_initialized());

    let observed = state.borrow();
    assert_eq!(observed.commands[0], 0);
    assert_eq!(observed.commands[1..5], [1, 1, 1, 1]);
    assert_eq!(observed.commands[5..8], [9, 10, 58]);
    assert_eq!(observed.commands[8], 17);
    assert!(!observed.selected);
}

#[test]
fn repeated_sector_read_costs_one_transaction() {
    let (mut card, state) = ready_card();
    let before = state.borrow().transactions;
    let first = card.read_sector(PARTITION_FIRST_SECTOR).unwrap().to_vec();
    let second = card.read_sector(PARTITION_FIRST_SECTOR).unwrap().to_vec();
    assert_eq!(state.borrow().transactions, before + 1);
    assert_eq!(first, second);
    assert_eq!(first, sector_of(&card_image(), PARTITION_FIRST_SECTOR));
    assert_eq!(card.cached_sector_index(), Some(PARTITION_FIRST_SECTOR));
}

#[test]
fn sector_reads_need_init_and_stay_in_range() {
    let state = fake_card(card_image());
    let mut card = card_with(&state, SdCardConfig::default());
    assert_eq!(card.read_sector(0), Err(SdCardError::NotInitialized));

    card.init(&mut NoDelay::default()).unwrap();
    assert_eq!(
        card.read_sector(CARD_SECTORS),
        Err(SdCardError::OutOfRange(CARD_SECTORS))
    );
    assert!(card.read_sector(CARD_SECTORS - 1).is_ok());
}

#[test]
fn silent_card_fails_reset() {
    let state = fake_card(card_image());
    state.borrow_mut().silent = true;
    let mut card = card_with(&state, SdCardConfig::default().with_timeout_ms(20));
    assert_eq!(
        card.init(&mut NoDelay::default()),
        Err(SdCardError::ResetFailed(0xFF))
    );
    assert!(!card.is_initialized());
}

#[test]
fn busy_data_line_times_out_before_reset() {
    let state = fake_card(card_image());
    state.borrow_mut().hold_data_low = true;
    let mut card = card_with(&state, SdCardConfig::default().with_ready_timeout_ms(50));
    assert_eq!(card.init(&mut NoDelay::default()), Err(SdCardError::NotReady));
    assert!(state.borrow().commands.is_empty());
}

#[test]
fn idle_retry_limit_bounds_bring_up() {
    let state = fake_card(card_image());
    state.borrow_mut().idle_polls = 100;
    let mut card = card_with(
        &state,
        SdCardConfig::default().with_idle_retry_limit(Some(5)),
    );
    assert_eq!(
        card.init(&mut NoDelay::default()),
        Err(SdCardError::StillIdle(0x01))
    );
    let cmd1_count = state.borrow().commands.iter().filter(|&&c| c == 1).count();
    assert_eq!(cmd1_count, 5);
}

#[test]
fn csd_version_one_is_unsupported() {
    let state = fake_card(card_image());
    state.borrow_mut().csd = [0u8; 16];
    let mut card = card_with(&state, SdCardConfig::default());
    assert_eq!(
        card.init(&mut NoDelay::default()),
        Err(SdCardError::UnsupportedCard(0))
    );
    assert!(card.registers().is_none());
}

#[test]
fn missing_fat_partition_is_reported() {
    let mut image = card_image().as_ref().clone();
    image[..SD_SECTOR_SIZE].copy_from_slice(&mbr(0x83, PARTITION_FIRST_SECTOR, PARTITION_SECTORS));
    let state = fake_card(std::sync::Arc::new(image));
    let mut card = card_with(&state, SdCardConfig::default());
    assert_eq!(
        card.init(&mut NoDelay::default()),
        Err(SdCardError::PartitionNotFound)
    );
}

#[test]
fn strict_partition_policy_rejects_masked_types() {
    let mut image = card_image().as_ref().clone();
    image[..SD_SECTOR_SIZE].copy_from_slice(&mbr(0x0B, PARTITION_FIRST_SECTOR, PARTITION_SECTORS));
    let image = std::sync::Arc::new(image);

    let state = fake_card(image.clone());
    let mut card = card_with(&state, SdCardConfig::default());
    let status = card.init(&mut NoDelay::default()).unwrap();
    assert_eq!(status.partition.partition_type, 0x0B);

    let state = fake_card(image);
    let mut card = card_with(
        &state,
        SdCardConfig::default().with_partition_match(PartitionTypeMatch::Fat32LbaOnly),
    );
    assert_eq!(
        card.init(&mut NoDelay::default()),
        Err(SdCardError::PartitionNotFound)
    );
}

#[test]
fn timed_out_read_is_never_cached() {
    let (mut card, state) = ready_card();
    card.read_sector(1).unwrap();
    state.borrow_mut().withhold_data_token = true;
    assert_eq!(card.read_sector(2), Err(SdCardError::Timeout(17)));
    assert_eq!(card.cached_sector_index(), Some(1));
    assert!(!state.borrow().selected);

    state.borrow_mut().withhold_data_token = false;
    let sector = card.read_sector(2).unwrap().to_vec();
    assert_eq!(sector, sector_of(&card_image(), 2));
}

#[test]
fn rejected_read_reports_r1() {
    let (mut card, state) = ready_card();
    state.borrow_mut().reject_reads = true;
    assert_eq!(
        card.read_sector(3),
        Err(SdCardError::CommandRejected { cmd: 17, r1: 0x40 })
    );
    assert!(!state.borrow().selected);
}

#[test]
fn streaming_read_holds_the_bus_until_finished() {
    let (mut card, state) = ready_card();
    let sector = PARTITION_FIRST_SECTOR + 1;
    card.read_sector_streaming(sector).unwrap();
    assert!(card.is_streaming());
    assert!(state.borrow().selected);
    assert_eq!(card.read_sector(3), Err(SdCardError::TransactionOpen));
    assert_eq!(
        card.read_sector_streaming(sector),
        Err(SdCardError::TransactionOpen)
    );

    let mut streamed = Vec::with_capacity(SD_SECTOR_SIZE);
    for _ in 0..SD_SECTOR_SIZE {
        streamed.push(card.stream_byte().unwrap());
    }
    assert_eq!(streamed, sector_of(&card_image(), sector));
    assert_eq!(card.stream_byte(), Err(SdCardError::StreamExhausted));
    assert!(card.is_streaming());
    assert!(state.borrow().selected);

    card.finish_streaming().unwrap();
    assert!(!card.is_streaming());
    assert!(!state.borrow().selected);
    assert_eq!(card.finish_streaming(), Err(SdCardError::NoTransaction));
}

#[test]
fn finishing_a_stream_early_leaves_the_card_usable() {
    let (mut card, _state) = ready_card();
    card.read_sector(5).unwrap();
    card.read_sector_streaming(6).unwrap();
    for _ in 0..10 {
        card.stream_byte().unwrap();
    }
    card.finish_streaming().unwrap();

    // The stream bypassed the buffer, so sector 5 is still cached.
    assert_eq!(card.cached_sector_index(), Some(5));
    let next = card.read_sector(7).unwrap().to_vec();
    assert_eq!(next, sector_of(&card_image(), 7));
}

#[test]
fn reinit_starts_from_scratch() {
    let (mut card, state) = ready_card();
    card.read_sector(9).unwrap();
    state.borrow_mut().idle_polls = 1;
    card.init(&mut NoDelay::default()).unwrap();
    // The partition scan leaves the MBR cached.
    assert_eq!(card.cached_sector_index(), Some(0));
}

#[test]
fn register_read_failures_release_chip_select() {
    // CMD9 answers but its data token never arrives.
    let state = fake_card(card_image());
    state.borrow_mut().withhold_register = Some(9);
    let mut card = card_with(&state, SdCardConfig::default().with_timeout_ms(20));
    assert_eq!(
        card.init(&mut NoDelay::default()),
        Err(SdCardError::RegisterRead { cmd: 9, r1: 0xFF })
    );
    assert!(!state.borrow().selected);
    assert!(!card.is_initialized());

    // CMD10 never answers at all.
    let state = fake_card(card_image());
    state.borrow_mut().mute_command = Some(10);
    let mut card = card_with(&state, SdCardConfig::default().with_timeout_ms(20));
    assert_eq!(
        card.init(&mut NoDelay::default()),
        Err(SdCardError::RegisterRead { cmd: 10, r1: 0xFF })
    );
    assert!(!state.borrow().selected);

    let state = fake_card(card_image());
    state.borrow_mut().mute_command = Some(58);
    let mut card = card_with(&state, SdCardConfig::default().with_timeout_ms(20));
    assert_eq!(
        card.init(&mut NoDelay::default()),
        Err(SdCardError::RegisterRead { cmd: 58, r1: 0xFF })
    );
    assert!(!state.borrow().selected);
}

#[test]
fn wake_clocks_never_drop_below_eighty() {
    let state = fake_card(card_image());
    let config = SdCardConfig {
        wake_bytes: 0,
        ..SdCardConfig::default()
    };
    let mut card = card_with(&state, config);
    card.init(&mut NoDelay::default()).unwrap();
    // Ten wake bytes plus the single ready poll.
    assert_eq!(state.borrow().wake_clocks, 11);

    let state = fake_card(card_image());
    let mut card = card_with(&state, SdCardConfig::default());
    card.init(&mut NoDelay::default()).unwrap();
    assert_eq!(state.borrow().wake_clocks, 513);
}

#[test]
fn constructing_a_card_leaves_chip_select_alone() {
    let state = fake_card(card_image());
    let card = card_with(&state, SdCardConfig::default());
    assert!(!card.is_initialized());
    let observed = state.borrow();
    assert_eq!(observed.cs_writes, 0);
    assert_eq!(observed.wake_clocks, 0);
    assert_eq!(observed.transactions, 0);
    assert!(observed.commands.is_empty());
}
