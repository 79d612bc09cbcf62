//! Fake SPI-mode SD card over an in-memory disk image, and FAT32 images built
//! with `fatfs`.
#![allow(dead_code)]

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    convert::Infallible,
    io::{Cursor, Write},
    rc::Rc,
    sync::{Arc, OnceLock},
};

use embedded_hal::{delay::DelayNs, digital, spi};
use sdcard_fat32::{Clock, SdCard, SdCardConfig, SD_SECTOR_SIZE};

pub const CARD_SECTORS: u32 = 96 * 1024;
pub const PARTITION_FIRST_SECTOR: u32 = 2048;
pub const PARTITION_SECTORS: u32 = 80 * 1024;
pub const VOLUME_LABEL: &[u8; 11] = b"SDTEST     ";
pub const VOLUME_ID: u32 = 0x5D_CA_2D_01;

pub const HELLO: &[u8] = b"Hello from the card!\n";
pub const LONG_FILE_NAME: &str = "A rather long file name.txt";
pub const LONG_FILE_BODY: &[u8] = b"long names survive";

pub const CID: [u8; 16] = [
    0x03, b'S', b'D', b'S', b'D', b'1', b'6', b'G', 0x80, 0x12, 0x34, 0x56, 0x78, 0x01, 0x4A, 0x01,
];
pub const OCR: u32 = 0xC0FF_8000;

pub fn track_bytes() -> Vec<u8> {
    (0..3000u32).map(|i| (i * 31 + i / 7) as u8).collect()
}

/// CSD version 2.0 describing `sectors` 512-byte sectors.
pub fn csd_v2(sectors: u32) -> [u8; 16] {
    let c_size = sectors / 1024 - 1;
    let mut csd = [0u8; 16];
    csd[0] = 0x40;
    csd[7] = ((c_size >> 16) & 0x3F) as u8;
    csd[8] = (c_size >> 8) as u8;
    csd[9] = c_size as u8;
    csd
}

pub fn mbr(partition_type: u8, first: u32, count: u32) -> [u8; SD_SECTOR_SIZE] {
    let mut sector = [0u8; SD_SECTOR_SIZE];
    let base = 0x1BE;
    sector[base] = 0x80;
    sector[base + 4] = partition_type;
    sector[base + 8..base + 12].copy_from_slice(&first.to_le_bytes());
    sector[base + 12..base + 16].copy_from_slice(&count.to_le_bytes());
    sector[0x1FE] = 0x55;
    sector[0x1FF] = 0xAA;
    sector
}

fn build_volume() -> Vec<u8> {
    let mut partition = Cursor::new(vec![0u8; PARTITION_SECTORS as usize * SD_SECTOR_SIZE]);
    fatfs::format_volume(
        &mut partition,
        fatfs::FormatVolumeOptions::new()
            .fat_type(fatfs::FatType::Fat32)
            .bytes_per_cluster(512)
            .volume_label(*VOLUME_LABEL)
            .volume_id(VOLUME_ID),
    )
    .expect("format FAT32");
    partition.set_position(0);

    let fs = fatfs::FileSystem::new(&mut partition, fatfs::FsOptions::new()).expect("mount");
    {
        let root = fs.root_dir();
        root.create_file("HELLO.TXT")
            .expect("create hello")
            .write_all(HELLO)
            .expect("write hello");
        root.create_file(LONG_FILE_NAME)
            .expect("create long")
            .write_all(LONG_FILE_BODY)
            .expect("write long");
        root.create_file("EMPTY.BIN").expect("create empty");
        let music = root.create_dir("music").expect("create music");
        music
            .create_file("track01.raw")
            .expect("create track")
            .write_all(&track_bytes())
            .expect("write track");
        let deep = music.create_dir("deep").expect("create deep");
        deep.create_file("notes.md")
            .expect("create notes")
            .write_all(b"# notes\n")
            .expect("write notes");
    }
    fs.unmount().expect("unmount");
    partition.into_inner()
}

/// Whole-card image: MBR, a gap, then the FAT32 partition.
pub fn card_image() -> Arc<Vec<u8>> {
    static IMAGE: OnceLock<Arc<Vec<u8>>> = OnceLock::new();
    IMAGE
        .get_or_init(|| {
            let mut image = vec![0u8; CARD_SECTORS as usize * SD_SECTOR_SIZE];
            image[..SD_SECTOR_SIZE].copy_from_slice(&mbr(
                0x0C,
                PARTITION_FIRST_SECTOR,
                PARTITION_SECTORS,
            ));
            let start = PARTITION_FIRST_SECTOR as usize * SD_SECTOR_SIZE;
            let volume = build_volume();
            image[start..start + volume.len()].copy_from_slice(&volume);
            Arc::new(image)
        })
        .clone()
}

pub fn sector_of(image: &[u8], index: u32) -> &[u8] {
    let start = index as usize * SD_SECTOR_SIZE;
    &image[start..start + SD_SECTOR_SIZE]
}

/// Behaviour of the emulated card plus what it observed on the bus.
pub struct CardState {
    image: Arc<Vec<u8>>,
    pub csd: [u8; 16],
    pub cid: [u8; 16],
    pub ocr: u32,
    pub selected: bool,
    frame: Vec<u8>,
    out: VecDeque<u8>,
    /// CMD1 answers "still idle" this many times before reporting ready.
    pub idle_polls: u32,
    /// Bytes of 0xFF before every data token.
    pub token_delay: usize,
    pub silent: bool,
    pub hold_data_low: bool,
    pub withhold_data_token: bool,
    pub reject_reads: bool,
    /// Answers this register command with r1 = 0 but never sends its data.
    pub withhold_register: Option<u8>,
    /// Never answers this command.
    pub mute_command: Option<u8>,
    /// Bytes clocked with chip select high before the first command.
    pub wake_clocks: usize,
    /// Every chip-select level change requested, redundant ones included.
    pub cs_writes: usize,
    /// Chip-select assertions seen so far.
    pub transactions: usize,
    pub commands: Vec<u8>,
}

impl CardState {
    fn exchange(&mut self, mosi: u8) -> u8 {
        if !self.selected {
            if self.transactions == 0 {
                self.wake_clocks += 1;
            }
            return if self.hold_data_low { 0x00 } else { 0xFF };
        }
        if let Some(byte) = self.out.pop_front() {
            return byte;
        }
        if self.frame.is_empty() && (mosi & 0xC0) != 0x40 {
            return 0xFF;
        }
        self.frame.push(mosi);
        if self.frame.len() == 6 {
            let frame = std::mem::take(&mut self.frame);
            self.respond(&frame);
        }
        0xFF
    }

    fn respond(&mut self, frame: &[u8]) {
        let cmd = frame[0] & 0x3F;
        let arg = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
        self.commands.push(cmd);
        if self.silent || self.mute_command == Some(cmd) {
            return;
        }
        // One byte of command response time.
        self.out.push_back(0xFF);
        match cmd {
            0 => self.out.push_back(0x01),
            1 => {
                if self.idle_polls > 0 {
                    self.idle_polls -= 1;
                    self.out.push_back(0x01);
                } else {
                    self.out.push_back(0x00);
                }
            }
            9 | 10 if self.withhold_register == Some(cmd) => self.out.push_back(0x00),
            9 => {
                let csd = self.csd;
                self.push_block(&csd);
            }
            10 => {
                let cid = self.cid;
                self.push_block(&cid);
            }
            58 => {
                self.out.push_back(0x00);
                self.out.extend(self.ocr.to_be_bytes());
            }
            17 => {
                let start = arg as usize * SD_SECTOR_SIZE;
                if self.reject_reads || start + SD_SECTOR_SIZE > self.image.len() {
                    self.out.push_back(0x40);
                } else if self.withhold_data_token {
                    self.out.push_back(0x00);
                } else {
                    let image = Arc::clone(&self.image);
                    self.push_block(&image[start..start + SD_SECTOR_SIZE]);
                }
            }
            _ => self.out.push_back(0x04),
        }
    }

    fn push_block(&mut self, payload: &[u8]) {
        self.out.push_back(0x00);
        self.out.extend(std::iter::repeat(0xFF).take(self.token_delay));
        self.out.push_back(0xFE);
        self.out.extend(payload.iter().copied());
        self.out.extend([0x12, 0x34]);
    }
}

pub type SharedCard = Rc<RefCell<CardState>>;

pub struct FakeSpi(SharedCard);
pub struct FakeCs(SharedCard);

impl spi::ErrorType for FakeSpi {
    type Error = Infallible;
}

impl spi::SpiBus<u8> for FakeSpi {
    fn read(&mut self, words: &mut [u8]) -> Result<(), Infallible> {
        let mut card = self.0.borrow_mut();
        for word in words {
            *word = card.exchange(0xFF);
        }
        Ok(())
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Infallible> {
        let mut card = self.0.borrow_mut();
        for &word in words {
            card.exchange(word);
        }
        Ok(())
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Infallible> {
        let mut card = self.0.borrow_mut();
        let len = read.len().max(write.len());
        for idx in 0..len {
            let miso = card.exchange(write.get(idx).copied().unwrap_or(0xFF));
            if let Some(slot) = read.get_mut(idx) {
                *slot = miso;
            }
        }
        Ok(())
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Infallible> {
        let mut card = self.0.borrow_mut();
        for word in words {
            *word = card.exchange(*word);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Infallible> {
        Ok(())
    }
}

impl digital::ErrorType for FakeCs {
    type Error = Infallible;
}

impl digital::OutputPin for FakeCs {
    fn set_low(&mut self) -> Result<(), Infallible> {
        let mut card = self.0.borrow_mut();
        card.cs_writes += 1;
        if !card.selected {
            card.selected = true;
            card.transactions += 1;
        }
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        let mut card = self.0.borrow_mut();
        card.cs_writes += 1;
        card.selected = false;
        card.frame.clear();
        card.out.clear();
        Ok(())
    }
}

/// Advances one millisecond every time it is read.
#[derive(Default)]
pub struct TickClock(Cell<u32>);

impl TickClock {
    pub fn starting_at(ms: u32) -> Self {
        Self(Cell::new(ms))
    }
}

impl Clock for TickClock {
    fn now_ms(&self) -> u32 {
        let now = self.0.get();
        self.0.set(now.wrapping_add(1));
        now
    }
}

/// Records requested delays without sleeping.
#[derive(Default)]
pub struct NoDelay {
    pub total_ns: u64,
}

impl DelayNs for NoDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.total_ns += ns as u64;
    }
}

pub type TestCard = SdCard<FakeSpi, FakeCs, TickClock>;

pub fn fake_card(image: Arc<Vec<u8>>) -> SharedCard {
    Rc::new(RefCell::new(CardState {
        image,
        csd: csd_v2(CARD_SECTORS),
        cid: CID,
        ocr: OCR,
        selected: false,
        frame: Vec::new(),
        out: VecDeque::new(),
        idle_polls: 3,
        token_delay: 2,
        silent: false,
        hold_data_low: false,
        withhold_data_token: false,
        reject_reads: false,
        withhold_register: None,
        mute_command: None,
        wake_clocks: 0,
        cs_writes: 0,
        transactions: 0,
        commands: Vec::new(),
    }))
}

pub fn card_with(state: &SharedCard, config: SdCardConfig) -> TestCard {
    SdCard::with_config(
        FakeSpi(Rc::clone(state)),
        FakeCs(Rc::clone(state)),
        TickClock::default(),
        config,
    )
}

pub fn ready_card() -> (TestCard, SharedCard) {
    let state = fake_card(card_image());
    let mut card = card_with(&state, SdCardConfig::default());
    card.init(&mut NoDelay::default()).expect("card init");
    (card, state)
}
