//! STUN messages used for connectivity checks

use crate::IceCredentials;
use std::net::SocketAddr;
use stun_types::{
    Class, Message, MessageBuilder, Method, TransactionId,
    attributes::{
        ErrorCode, Fingerprint, IceControlled, IceControlling, MessageIntegrity,
        MessageIntegrityKey, Priority, UseCandidate, Username, XorMappedAddress,
    },
};

/// Parameters of a binding request on a candidate pair
pub(crate) struct BindingRequest<'a> {
    pub(crate) transaction_id: TransactionId,
    pub(crate) local_credentials: &'a IceCredentials,
    pub(crate) remote_credentials: &'a IceCredentials,
    /// Priority of a peer-reflexive candidate learned from this request
    pub(crate) priority: u32,
    pub(crate) is_controlling: bool,
    pub(crate) control_tie_breaker: u64,
    pub(crate) use_candidate: bool,
}

pub(crate) fn make_binding_request(request: BindingRequest<'_>) -> Result<Vec<u8>, stun_types::Error> {
    let mut stun_message =
        MessageBuilder::new(Class::Request, Method::Binding, request.transaction_id);

    let username = format!(
        "{}:{}",
        request.remote_credentials.ufrag, request.local_credentials.ufrag
    );
    stun_message.add_attr(Username::new(&username));
    stun_message.add_attr(Priority(request.priority));

    if request.is_controlling {
        stun_message.add_attr(IceControlling(request.control_tie_breaker));
    } else {
        stun_message.add_attr(IceControlled(request.control_tie_breaker));
    }

    if request.use_candidate {
        stun_message.add_attr(UseCandidate);
    }

    stun_message.add_attr_with(
        MessageIntegrity,
        MessageIntegrityKey::new(&request.remote_credentials.pwd),
    );

    stun_message.add_attr(Fingerprint);

    stun_message.finish()
}

pub(crate) fn make_success_response(
    transaction_id: TransactionId,
    local_credentials: &IceCredentials,
    source: SocketAddr,
) -> Result<Vec<u8>, stun_types::Error> {
    let mut stun_message = MessageBuilder::new(Class::Success, Method::Binding, transaction_id);

    stun_message.add_attr(XorMappedAddress(source));
    stun_message.add_attr_with(
        MessageIntegrity,
        MessageIntegrityKey::new(&local_credentials.pwd),
    );

    stun_message.add_attr(Fingerprint);

    stun_message.finish()
}

/// 487 (Role Conflict) error response, [RFC8445](https://datatracker.ietf.org/doc/html/rfc8445#section-7.3.1.1)
pub(crate) fn make_role_error(
    transaction_id: TransactionId,
    local_credentials: &IceCredentials,
) -> Result<Vec<u8>, stun_types::Error> {
    let mut stun_message = MessageBuilder::new(Class::Error, Method::Binding, transaction_id);

    stun_message.add_attr(ErrorCode {
        number: ErrorCode::ROLE_CONFLICT,
        reason: "Role Conflict",
    });

    // Responses are authenticated with the password of the agent that received the request
    stun_message.add_attr_with(
        MessageIntegrity,
        MessageIntegrityKey::new(&local_credentials.pwd),
    );
    stun_message.add_attr(Fingerprint);

    stun_message.finish()
}

pub(crate) fn verify_integrity(
    local_credentials: &IceCredentials,
    remote_credentials: &IceCredentials,
    stun_msg: &mut Message,
) -> bool {
    let is_request = match stun_msg.class() {
        Class::Request | Class::Indication => true,
        Class::Success | Class::Error => false,
    };

    let key = if is_request {
        &local_credentials.pwd
    } else {
        &remote_credentials.pwd
    };

    let passed_integrity_check = stun_msg
        .attribute_with::<MessageIntegrity>(MessageIntegrityKey::new(key))
        .is_some_and(|r| r.is_ok());

    if !passed_integrity_check {
        return false;
    }

    if is_request {
        // STUN requests require the USERNAME attribute to be set, validate that is contains the one we expect
        let expected_username = format!("{}:{}", local_credentials.ufrag, remote_credentials.ufrag);
        let username = match stun_msg.attribute::<Username>() {
            Some(Ok(username)) => username,
            Some(Err(e)) => {
                log::debug!("Failed to parse STUN username attribute, {e}");
                return false;
            }
            None => {
                log::debug!("STUN request is missing the USERNAME attribute");
                return false;
            }
        };

        if username.0 != expected_username {
            return false;
        }
    }

    // All checks passed
    true
}

/// Connectivity check messages must carry a valid FINGERPRINT
pub(crate) fn verify_fingerprint(stun_msg: &mut Message) -> bool {
    stun_msg
        .attribute::<Fingerprint>()
        .is_some_and(|r| r.is_ok())
}
