//! Wires a control panel and a peripheral device together over an
//! in-memory channel, brings the secure channel up and pushes a couple of
//! commands and events through the pair.

use keel::crypto::Aes128Suite;
use keel::logging;
use osdp::*;
use std::thread::sleep;
use std::time::Duration;

fn main() {
    let log = logging::terminal();

    let (near, far) = MemoryChannel::pair();

    let id = PdId {
        vendor_code: 0x00a1_b2c3,
        model: 4,
        version: 5,
        serial_number: 0x1122_3344,
        firmware_version: 0x0001_0203,
    };
    let capabilities = vec![
        Capability::new(CapFunction::OutputControl, 1, 4),
        Capability::new(CapFunction::ReaderLedControl, 1, 2),
        Capability::new(CapFunction::ReaderAudibleOutput, 1, 1),
        Capability::new(CapFunction::ReaderTextOutput, 1, 1),
    ];

    let mut cp = ControlPanel::setup(
        vec![PdInfo {
            address: 5,
            baud_rate: 9600,
            id,
            capabilities: capabilities.clone(),
            scbk: None,
            channel: Box::new(near),
        }],
        CpConfig {
            master_key: Some([0xa5; 16]),
            ..CpConfig::default()
        },
        Box::new(Aes128Suite),
        &log,
    );

    let mut pd = PeripheralDevice::setup(
        PdInfo {
            address: 5,
            baud_rate: 9600,
            id,
            capabilities,
            scbk: None, // install mode; the panel provisions a key
            channel: Box::new(far),
        },
        Box::new(Aes128Suite),
        &log,
    );

    cp.set_callback_key_press(|pd, key| println!("pd[{}] key press: {:#04x}", pd, key));
    cp.set_callback_card_read(|pd, format, count, data| {
        println!("pd[{}] card read ({:?}, {} bits): {:02x?}", pd, format, count, data)
    });
    pd.set_command_callback(|cmd| {
        println!("pd handling {:?}", cmd);
        true
    });

    // Bring the session (and secure channel) up.
    while !(cp.is_online(0) && cp.is_sc_active(0)) {
        cp.update();
        pd.update();
        sleep(Duration::from_millis(1));
    }
    println!("device online, secure channel active");

    cp.send_command(
        0,
        Command::Led(LedCommand {
            reader: 0,
            led_number: 1,
            temporary: LedParams {
                control_code: 2,
                on_count: 5,
                off_count: 5,
                on_color: 1,
                off_color: 0,
                timer_count: 500,
            },
            permanent: LedParams::default(),
        }),
    )
    .expect("device is online");

    let mut keys = [0u8; KEYPRESS_MAX_LEN];
    keys[..4].copy_from_slice(b"1234");
    pd.notify_event(Event::KeyPress(KeyPressEvent {
        reader: 0,
        length: 4,
        data: keys,
    }))
    .expect("event queue has room");

    for _ in 0..100 {
        cp.update();
        pd.update();
        sleep(Duration::from_millis(5));
    }

    println!(
        "done; online={} sc_active={}",
        cp.is_online(0),
        cp.is_sc_active(0)
    );
}
