use nor_kv::Config;
use nor_kv_cli::error::Error;
use nor_kv_cli::{FileFlash, format_statistics, open_store};
use pretty_assertions::assert_eq;
use tempfile::NamedTempFile;

#[test]
fn store_survives_save_and_load() {
    let image = NamedTempFile::new().unwrap();

    let mut flash = FileFlash::blank(4 * 4096).unwrap();
    {
        let mut kv = open_store(&mut flash, Config::default()).unwrap();
        kv.set("greeting", "hello").unwrap();
        kv.set("count", 3u32).unwrap();
    }
    flash.save(image.path()).unwrap();

    let metadata = std::fs::metadata(image.path()).unwrap();
    assert_eq!(metadata.len(), 4 * 4096);

    let mut flash = FileFlash::load(image.path()).unwrap();
    let mut kv = open_store(&mut flash, Config::default()).unwrap();
    assert_eq!(kv.get::<String>("greeting").unwrap(), "hello");
    assert_eq!(kv.get::<u32>("count").unwrap(), 3);
    assert_eq!(kv.list().unwrap().len(), 2);
}

#[test]
fn truncated_image_is_rejected() {
    let image = NamedTempFile::new().unwrap();
    std::fs::write(image.path(), vec![0xFFu8; 4096 + 1]).unwrap();

    assert!(matches!(
        FileFlash::load(image.path()),
        Err(Error::InvalidImageSize(4097))
    ));
}

#[test]
fn statistics_report() {
    let mut flash = FileFlash::blank(2 * 4096).unwrap();
    let mut kv = open_store(&mut flash, Config::default()).unwrap();
    kv.set("a", "1").unwrap();

    let report = format_statistics(&kv.statistics().unwrap());
    assert_eq!(
        report,
        "blocks: 1 clean, 1 used, 0 dirty\n\
         \x20 block  0: Used  free 4080 items 1\n\
         \x20 block  1: Clean free 4092 items 0\n\
         live items: 1\n\
         write position: 0x0010\n\
         mapping entries: 1\n"
    );
}
