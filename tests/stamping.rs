use flashlink::{
    crc32, stm32, BuildInfo, CrcMode, Error, FirmwareImage, Section, Stamper, VersionInfo,
    OFFSET_IMAGE_CRC, VCS_INFO_END, VCS_INFO_START, VERSION_INFO_SIZE,
};

fn record() -> Vec<u8> {
    let mut record = vec![0u8; VERSION_INFO_SIZE];
    record[..16].copy_from_slice(VCS_INFO_START);
    record[VERSION_INFO_SIZE - 16..].copy_from_slice(VCS_INFO_END);
    record
}

fn build() -> BuildInfo {
    BuildInfo {
        vcs_id: "v1.4.2-3-gdeadbee-dirty".into(),
        user: "builder".into(),
        host: "a-rather-long-build-host-name".into(),
        date: "2024-05-01".into(),
        time: "12:34:56".into(),
    }
}

fn image_with_record(len: usize, at: usize) -> Vec<u8> {
    let mut data: Vec<u8> = (0..len).map(|i| (i * 7 + 3) as u8).collect();
    data[at..at + VERSION_INFO_SIZE].copy_from_slice(&record());
    data
}

#[test]
fn test_stamp_raw() {
    let mut data = image_with_record(4096, 0x188);

    let report = Stamper::new().stamp_raw(&mut data, &build()).unwrap();

    assert_eq!(report.info_offset, 0x188);
    assert_eq!(report.image_start, 0);
    assert_eq!(report.image_size, 4096);
    assert_eq!(crc32(&data), 0);

    let info = VersionInfo::find(&data).unwrap();
    assert_eq!(info.image_crc, report.image_crc);
    assert_eq!(info.image_size, 4096);
    assert_eq!(info.vcs_id, "v1.4.2-3-gdeadbee-dirty");
    assert_eq!(info.build_host, "a-rather-long-bu");
    assert_eq!(info.build_date, "2024-05-01");
}

#[test]
fn test_stamp_raw_custom_target() {
    let mut data = image_with_record(1000, 10);
    Stamper::new()
        .with_target_crc(0xDEAD_BEEF)
        .stamp_raw(&mut data, &build())
        .unwrap();
    assert_eq!(crc32(&data), 0xDEAD_BEEF);
}

#[test]
fn test_already_stamped_leaves_buffer_untouched() {
    let mut data = image_with_record(1024, 64);
    data[64 + OFFSET_IMAGE_CRC..64 + OFFSET_IMAGE_CRC + 4].copy_from_slice(&[1, 0, 0, 0]);
    let before = data.clone();

    let result = Stamper::new().stamp_raw(&mut data, &build());

    assert!(matches!(result, Err(Error::AlreadyStamped(1))));
    assert_eq!(data, before);
}

#[test]
fn test_force_restamps() {
    let mut data = image_with_record(1024, 64);
    Stamper::new().stamp_raw(&mut data, &build()).unwrap();

    let mut newer = build();
    newer.vcs_id = "v1.4.3".into();
    Stamper::new()
        .with_force(true)
        .stamp_raw(&mut data, &newer)
        .unwrap();

    assert_eq!(crc32(&data), 0);
    assert_eq!(VersionInfo::find(&data).unwrap().vcs_id, "v1.4.3");
}

#[test]
fn test_marker_not_found() {
    let mut data = vec![0u8; 512];
    assert!(matches!(
        Stamper::new().stamp_raw(&mut data, &build()),
        Err(Error::MarkerNotFound)
    ));

    // start marker without a matching end marker
    data[100..116].copy_from_slice(VCS_INFO_START);
    assert!(matches!(
        Stamper::new().stamp_raw(&mut data, &build()),
        Err(Error::MarkerNotFound)
    ));
}

#[test]
fn test_stamp_stm32() {
    let mut data = image_with_record(2048, 0x200);
    Stamper::new()
        .with_mode(CrcMode::Stm32Hw)
        .stamp_raw(&mut data, &build())
        .unwrap();
    assert_eq!(stm32::hw_crc(&data).unwrap(), 0);
}

#[test]
fn test_stamp_stm32_rejects_unaligned_image() {
    let mut data = image_with_record(2046, 0x200);
    let before = data.clone();
    assert!(Stamper::new()
        .with_mode(CrcMode::Stm32Hw)
        .stamp_raw(&mut data, &build())
        .is_err());
    assert_eq!(data, before);
}

#[test]
fn test_no_crc_fills_metadata_only() {
    let mut data = image_with_record(512, 0);
    let report = Stamper::new()
        .with_mode(CrcMode::NoCrc)
        .stamp_raw(&mut data, &build())
        .unwrap();

    assert_eq!(report.image_crc, 0);
    let info = VersionInfo::find(&data).unwrap();
    assert_eq!(info.image_crc, 0);
    assert_eq!(info.build_user, "builder");
}

#[test]
fn test_stamp_sections() {
    let mut sections = vec![
        Section::new(".isr_vector", 0x0801_0000, vec![0x11; 0x188]),
        Section::new(".text", 0x0801_0200, image_with_record(0x400, 0x40)),
        Section::new(".data", 0x0801_0600, vec![0x22; 0x80]),
    ];

    let report = Stamper::new()
        .stamp_sections(&mut sections, &build())
        .unwrap();

    assert_eq!(report.section.as_deref(), Some(".text"));
    assert_eq!(report.info_offset, 0x40);
    assert_eq!(report.image_start, 0x0801_0000);
    assert_eq!(report.image_size, 0x680);

    let image = FirmwareImage::from_sections(&sections, 0xFF).unwrap();
    assert_eq!(image.len(), 0x680);
    assert_eq!(crc32(image.data()), 0);

    let info = VersionInfo::find(sections[1].data.as_deref().unwrap()).unwrap();
    assert_eq!(info.image_start, 0x0801_0000);
    assert_eq!(info.image_crc, report.image_crc);
}

#[test]
fn test_stamp_sections_without_marker() {
    let mut sections = vec![Section::new(".text", 0x0800_0000, vec![0; 256])];
    let before = sections.clone();
    assert!(matches!(
        Stamper::new().stamp_sections(&mut sections, &build()),
        Err(Error::MarkerNotFound)
    ));
    assert_eq!(sections, before);
}
