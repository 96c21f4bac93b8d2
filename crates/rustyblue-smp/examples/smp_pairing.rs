/// Example pairing two in-process SMP managers over a loopback link
///
/// Run with `RUST_LOG=rustyblue_smp=debug` to trace the PDU exchange.
use rustyblue_smp::smp::*;
use rustyblue_smp::{LeAddress, Role};
use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const CONN: ConnectionHandle = 0x0001;

enum Frame {
    Pdu(Role, Vec<u8>),
    Encrypt(EncryptionRequest),
}

type Link = Arc<Mutex<VecDeque<Frame>>>;

struct Loopback {
    role: Role,
    link: Link,
}

impl SmpTransport for Loopback {
    fn send(&mut self, _conn: ConnectionHandle, pdu: &[u8]) -> SmpResult<()> {
        let mut link = self
            .link
            .lock()
            .map_err(|_| SmpError::TransportError("link poisoned".into()))?;
        link.push_back(Frame::Pdu(self.role, pdu.to_vec()));
        Ok(())
    }

    fn start_encryption(
        &mut self,
        _conn: ConnectionHandle,
        request: &EncryptionRequest,
    ) -> SmpResult<()> {
        let mut link = self
            .link
            .lock()
            .map_err(|_| SmpError::TransportError("link poisoned".into()))?;
        link.push_back(Frame::Encrypt(request.clone()));
        Ok(())
    }
}

fn ask(prompt: &str) -> io::Result<bool> {
    print!("{} (y/n): ", prompt);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let answer = input.trim().to_lowercase();
    Ok(answer == "y" || answer == "yes")
}

/// Deliver frames and key agreement results until both sides go quiet
fn run(
    link: &Link,
    central: &mut SmpManager,
    peripheral: &mut SmpManager,
) -> Result<(), Box<dyn std::error::Error>> {
    loop {
        central.process_crypto_events();
        peripheral.process_crypto_events();

        let frame = link
            .lock()
            .map_err(|_| SmpError::TransportError("link poisoned".into()))?
            .pop_front();

        match frame {
            Some(Frame::Pdu(Role::Central, pdu)) => peripheral.handle_smp_packet(CONN, &pdu)?,
            Some(Frame::Pdu(Role::Peripheral, pdu)) => central.handle_smp_packet(CONN, &pdu)?,
            Some(Frame::Encrypt(request)) => {
                // Stand-in for the controllers running the encryption procedure
                let status = match peripheral.long_term_key_request(CONN, request.rand, request.ediv)? {
                    Some(ltk) if ltk == request.ltk => 0x00,
                    Some(_) => 0x3D,
                    None => 0x06,
                };
                peripheral.on_encryption_changed(CONN, status)?;
                central.on_encryption_changed(CONN, status)?;
            }
            None if central.crypto_busy() => {
                central.wait_crypto_event(Duration::from_millis(100));
            }
            None if peripheral.crypto_busy() => {
                peripheral.wait_crypto_event(Duration::from_millis(100));
            }
            None => return Ok(()),
        }
    }
}

fn print_events(name: &str, manager: &mut SmpManager) -> Vec<SmpEvent> {
    let mut events = Vec::new();
    while let Some(event) = manager.poll_event() {
        match &event {
            SmpEvent::NumericComparisonRequest(_, value) => {
                println!("[{}] confirm value {:06}", name, value)
            }
            SmpEvent::PairingComplete { bonded, .. } => {
                println!("[{}] pairing complete, bonded={}", name, bonded)
            }
            SmpEvent::PairingFailed { reason, .. } => println!("[{}] pairing failed: {}", name, reason),
            SmpEvent::SecurityChanged { level, error, .. } => {
                println!("[{}] security {} error={:?}", name, level, error)
            }
            other => println!("[{}] {:?}", name, other),
        }
        events.push(event);
    }
    events
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("SMP Pairing Example");
    println!("-----------------");

    let config = SmpConfig::default()
        .with_io_capability(IoCapability::DisplayYesNo)
        .with_mitm(true);

    let link: Link = Arc::new(Mutex::new(VecDeque::new()));
    let central_store = Arc::new(MemoryKeyStore::new());

    let mut central = SmpManager::new(
        config.clone(),
        Box::new(Loopback {
            role: Role::Central,
            link: link.clone(),
        }),
        central_store.clone(),
    )?;
    let mut peripheral = SmpManager::new(
        config,
        Box::new(Loopback {
            role: Role::Peripheral,
            link: link.clone(),
        }),
        Arc::new(MemoryKeyStore::new()),
    )?;

    let central_address = LeAddress::public([0x01, 0x02, 0x03, 0x04, 0x05, 0xC0]);
    let peripheral_address = LeAddress::public([0x11, 0x12, 0x13, 0x14, 0x15, 0xC0]);
    central.connected(CONN, Role::Central, central_address, peripheral_address)?;
    peripheral.connected(CONN, Role::Peripheral, peripheral_address, central_address)?;

    println!("Pairing {} with {}...", central_address, peripheral_address);
    central.start_security(CONN)?;
    run(&link, &mut central, &mut peripheral)?;

    let central_events = print_events("central", &mut central);
    print_events("peripheral", &mut peripheral);

    let value = central_events.iter().find_map(|event| match event {
        SmpEvent::NumericComparisonRequest(_, value) => Some(*value),
        _ => None,
    });

    if let Some(value) = value {
        if ask(&format!("Do both devices show {:06}?", value))? {
            central.passkey_confirm(CONN)?;
            peripheral.passkey_confirm(CONN)?;
        } else {
            central.auth_cancel(CONN)?;
        }
        run(&link, &mut central, &mut peripheral)?;
        print_events("central", &mut central);
        print_events("peripheral", &mut peripheral);
    }

    match central.security_level(CONN) {
        Some(level) => println!("Link security: {}", level),
        None => println!("Connection gone"),
    }

    println!("\nPaired devices:");
    let devices = central_store.get_paired_devices()?;
    if devices.is_empty() {
        println!("No paired devices.");
    }
    for (i, device) in devices.iter().enumerate() {
        println!("{}: {}", i + 1, device);
    }

    central.disconnected(CONN)?;
    peripheral.disconnected(CONN)?;
    println!("Example completed.");
    Ok(())
}
