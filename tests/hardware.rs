#[cfg(test)]
mod hardware {
    use std::env;
    use std::time::Duration;
    use serial_test::serial;
    use libinstsync::{Session, SessionConfig};
    use libinstsync::socket::SocketTransport;

    // Instrument resource, e.g. TCPIP0::192.168.0.12::5025::SOCKET
    fn address() -> Option<String> {
        match env::var("INSTSYNC_ADDRESS") {
            Ok(a) => Some(a),
            Err(_) => {
                println!("No instrument specified; exiting...");
                None
            }
        }
    }

    fn open(address: &str) -> Session<SocketTransport> {
        let config = SessionConfig::default();
        let mut session = Session::new(config);
        match session.open(address) {
            Ok(_) => { println!("Session to {} opened successfully", address); }
            Err(err) => { panic!("Could not open session: {}", err); }
        }
        session
    }

    #[test]
    #[serial]
    #[cfg_attr(not(feature = "hardware_tests"), ignore)]
    fn identify() {
        println!("\nRunning identify");

        let address = match address() {
            Some(a) => a,
            None => return
        };

        let mut session = open(&address);
        let idn = session.identity().unwrap();
        println!("Instrument: {}", idn);
        assert!(!idn.is_empty());
    }

    #[test]
    #[serial]
    #[cfg_attr(not(feature = "hardware_tests"), ignore)]
    fn clean_error_queue() {
        println!("\nRunning clean_error_queue");

        let address = match address() {
            Some(a) => a,
            None => return
        };

        let mut session = open(&address);
        session.clear_status().unwrap();
        session.check_errors().unwrap();
    }

    #[test]
    #[serial]
    #[cfg_attr(not(feature = "hardware_tests"), ignore)]
    fn synchronised_query() {
        println!("\nRunning synchronised_query");

        let address = match address() {
            Some(a) => a,
            None => return
        };

        let mut session = open(&address);
        session.clear_status().unwrap();
        session.arm_opc_reporting().unwrap();

        let idn = session.query_with_stb_poll_sync("*IDN?", Duration::from_secs(5)).unwrap();
        assert!(!idn.is_empty());
        session.check_errors().unwrap();
    }
}
