//! Pairing method selection and local pairing features

use super::config::SmpConfig;
use super::constants::*;
use super::pdu::PairingFeatures;
use super::types::*;
use crate::gap::Role;

/// Entry of the IO capability mapping tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    JustWorks,
    Display,
    Input,
    Confirm,
    /// Both sides can type and display: the central displays
    ByRole,
}

use Entry::*;

/// Legacy pairing, indexed `[remote][local]`
const LEGACY_METHODS: [[Entry; 5]; 5] = [
    [JustWorks, JustWorks, Input, JustWorks, Input],
    [JustWorks, JustWorks, Input, JustWorks, Input],
    [Display, Display, Input, JustWorks, Display],
    [JustWorks, JustWorks, JustWorks, JustWorks, JustWorks],
    [Display, Display, Input, JustWorks, ByRole],
];

/// Secure Connections pairing, indexed `[remote][local]`
const SC_METHODS: [[Entry; 5]; 5] = [
    [JustWorks, JustWorks, Input, JustWorks, Input],
    [JustWorks, Confirm, Input, JustWorks, Confirm],
    [Display, Display, Input, JustWorks, Display],
    [JustWorks, JustWorks, JustWorks, JustWorks, JustWorks],
    [Display, Confirm, Input, JustWorks, Confirm],
];

fn table_method(entry: Entry, role: Role) -> PairingMethod {
    match entry {
        JustWorks => PairingMethod::JustWorks,
        Display => PairingMethod::PasskeyDisplay,
        Input => PairingMethod::PasskeyInput,
        Confirm => PairingMethod::PasskeyConfirm,
        ByRole => match role {
            Role::Central => PairingMethod::PasskeyDisplay,
            Role::Peripheral => PairingMethod::PasskeyInput,
        },
    }
}

/// Select the pairing method from the exchanged pairing features.
///
/// `request` and `response` are the features of the initiator and the
/// responder. A reserved IO capability from the peer falls back to Just
/// Works.
pub fn pairing_method(
    secure_connections: bool,
    request: &PairingFeatures,
    response: &PairingFeatures,
    local_io: IoCapability,
    role: Role,
) -> PairingMethod {
    let remote_io = match role {
        Role::Central => response.io_capability,
        Role::Peripheral => request.io_capability,
    };
    let mitm = request.auth_req.contains(AuthReq::MITM) || response.auth_req.contains(AuthReq::MITM);

    if secure_connections && (request.oob_data_present() || response.oob_data_present()) {
        return PairingMethod::ScOob;
    }

    let Some(remote_io) = IoCapability::from_u8(remote_io) else {
        return PairingMethod::JustWorks;
    };

    if !secure_connections && request.oob_data_present() && response.oob_data_present() {
        return PairingMethod::LegacyOob;
    }

    if !mitm {
        return PairingMethod::JustWorks;
    }

    let table = if secure_connections {
        &SC_METHODS
    } else {
        &LEGACY_METHODS
    };

    table_method(
        table[remote_io.to_u8() as usize][local_io.to_u8() as usize],
        role,
    )
}

/// IO capability advertised in pairing features.
///
/// A fixed passkey gives a device without a display something to show.
pub fn local_io_capability(config: &SmpConfig) -> IoCapability {
    if config.fixed_passkey.is_none() {
        return config.io_capability;
    }

    match config.io_capability {
        IoCapability::NoInputNoOutput => IoCapability::DisplayOnly,
        IoCapability::KeyboardOnly => IoCapability::KeyboardDisplay,
        other => other,
    }
}

/// Drop the bits the local pairing mode does not understand.
pub fn mask_auth_req(config: &SmpConfig, auth: AuthReq) -> AuthReq {
    let mask = if config.sc_supported() {
        SMP_AUTH_REQ_SC_MASK
    } else {
        SMP_AUTH_REQ_LEGACY_MASK
    };
    AuthReq::from_bits_truncate(auth.bits() & mask)
}

/// Authentication requirements sent in a pairing PDU, derived from the
/// requested bits and the local configuration.
pub fn local_auth_req(config: &SmpConfig, requested: AuthReq) -> AuthReq {
    let mut auth = mask_auth_req(config, requested);

    let io = local_io_capability(config);
    let required = config.effective_required_security();
    if io == IoCapability::NoInputNoOutput
        || (!config.mitm && required < SecurityLevel::EncryptionWithAuthentication)
    {
        auth.remove(AuthReq::MITM);
    } else {
        auth.insert(AuthReq::MITM);
    }

    auth.set(AuthReq::BONDING, config.bondable);
    auth.set(AuthReq::KEYPRESS, config.keypress_notifications);

    if !config.ct2 {
        auth.remove(AuthReq::CT2);
    }
    if !config.sc_supported() {
        auth.remove(AuthReq::SC);
    }

    auth
}

/// Authentication requirements this device starts a procedure with.
pub fn default_auth_req(config: &SmpConfig) -> AuthReq {
    let mut auth = AuthReq::empty();
    auth.set(AuthReq::BONDING, config.bondable);
    auth.set(AuthReq::CT2, config.ct2);
    auth.set(AuthReq::SC, config.sc_supported());
    local_auth_req(config, auth)
}

/// Whether `level` can be reached at all with the local configuration.
pub fn level_reachable(config: &SmpConfig, level: SecurityLevel) -> bool {
    match level {
        SecurityLevel::None | SecurityLevel::EncryptionOnly => true,
        SecurityLevel::EncryptionWithAuthentication => {
            local_io_capability(config) != IoCapability::NoInputNoOutput
                || config.legacy_oob_present
                || config.sc_oob_present
        }
        SecurityLevel::SecureConnections => {
            config.sc_supported() && level_reachable(config, SecurityLevel::EncryptionWithAuthentication)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::config::ScSupport;
    use super::*;

    fn features(io: IoCapability, oob: bool, auth: AuthReq) -> PairingFeatures {
        PairingFeatures::new(io, oob, auth, 16, KeyDist::empty(), KeyDist::empty())
    }

    fn method(sc: bool, central_io: IoCapability, peripheral_io: IoCapability) -> (PairingMethod, PairingMethod) {
        let auth = AuthReq::MITM | AuthReq::BONDING;
        let req = features(central_io, false, auth);
        let rsp = features(peripheral_io, false, auth);
        (
            pairing_method(sc, &req, &rsp, central_io, Role::Central),
            pairing_method(sc, &req, &rsp, peripheral_io, Role::Peripheral),
        )
    }

    #[test]
    fn test_no_mitm_is_just_works() {
        let req = features(IoCapability::KeyboardDisplay, false, AuthReq::BONDING);
        let rsp = features(IoCapability::KeyboardDisplay, false, AuthReq::BONDING);
        assert_eq!(
            pairing_method(true, &req, &rsp, IoCapability::KeyboardDisplay, Role::Central),
            PairingMethod::JustWorks
        );
    }

    #[test]
    fn test_numeric_comparison_both_sides() {
        let (central, peripheral) =
            method(true, IoCapability::DisplayYesNo, IoCapability::KeyboardDisplay);
        assert_eq!(central, PairingMethod::PasskeyConfirm);
        assert_eq!(peripheral, PairingMethod::PasskeyConfirm);
    }

    #[test]
    fn test_passkey_roles_are_complementary() {
        let (central, peripheral) = method(true, IoCapability::KeyboardOnly, IoCapability::DisplayOnly);
        assert_eq!(central, PairingMethod::PasskeyInput);
        assert_eq!(peripheral, PairingMethod::PasskeyDisplay);

        let (central, peripheral) =
            method(false, IoCapability::KeyboardDisplay, IoCapability::KeyboardDisplay);
        assert_eq!(central, PairingMethod::PasskeyDisplay);
        assert_eq!(peripheral, PairingMethod::PasskeyInput);
    }

    #[test]
    fn test_legacy_display_yes_no_cannot_compare() {
        let (central, peripheral) =
            method(false, IoCapability::DisplayYesNo, IoCapability::DisplayYesNo);
        assert_eq!(central, PairingMethod::JustWorks);
        assert_eq!(peripheral, PairingMethod::JustWorks);
    }

    #[test]
    fn test_oob_selection() {
        let auth = AuthReq::BONDING;
        let req = features(IoCapability::NoInputNoOutput, true, auth);
        let rsp = features(IoCapability::NoInputNoOutput, false, auth);
        // One side with data is enough for Secure Connections
        assert_eq!(
            pairing_method(true, &req, &rsp, IoCapability::NoInputNoOutput, Role::Central),
            PairingMethod::ScOob
        );
        // Legacy needs both
        assert_eq!(
            pairing_method(false, &req, &rsp, IoCapability::NoInputNoOutput, Role::Central),
            PairingMethod::JustWorks
        );
        let rsp = features(IoCapability::NoInputNoOutput, true, auth);
        assert_eq!(
            pairing_method(false, &req, &rsp, IoCapability::NoInputNoOutput, Role::Peripheral),
            PairingMethod::LegacyOob
        );
    }

    #[test]
    fn test_reserved_remote_io_is_just_works() {
        let auth = AuthReq::MITM;
        let mut rsp = features(IoCapability::KeyboardDisplay, false, auth);
        rsp.io_capability = 0x07;
        let req = features(IoCapability::KeyboardDisplay, false, auth);
        assert_eq!(
            pairing_method(true, &req, &rsp, IoCapability::KeyboardDisplay, Role::Central),
            PairingMethod::JustWorks
        );
    }

    #[test]
    fn test_auth_req_without_io_drops_mitm() {
        let config = SmpConfig::default().with_mitm(true);
        let auth = default_auth_req(&config);
        assert!(!auth.contains(AuthReq::MITM));
        assert!(auth.contains(AuthReq::BONDING | AuthReq::SC | AuthReq::CT2));

        let config = config.with_io_capability(IoCapability::DisplayYesNo);
        assert!(default_auth_req(&config).contains(AuthReq::MITM));
    }

    #[test]
    fn test_legacy_only_masks_sc_bits() {
        let config = SmpConfig::default()
            .with_secure_connections(ScSupport::Disabled);
        let auth = local_auth_req(&config, AuthReq::SC | AuthReq::CT2 | AuthReq::BONDING);
        assert_eq!(auth, AuthReq::BONDING);
    }

    #[test]
    fn test_fixed_passkey_gives_display() {
        let config = SmpConfig::default().with_fixed_passkey(123456);
        assert_eq!(local_io_capability(&config), IoCapability::DisplayOnly);
        assert!(level_reachable(&config, SecurityLevel::EncryptionWithAuthentication));
        assert!(!level_reachable(&SmpConfig::default(), SecurityLevel::SecureConnections));
    }
}
