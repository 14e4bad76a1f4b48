use crate::pdu::reader::{read_pdu, ReadError};
use crate::pdu::writer::write_pdu;
use crate::pdu::*;

fn roundtrip(pdu: Pdu) {
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &pdu).unwrap();

    // the declared length covers exactly the written payload
    let declared = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
    assert_eq!(declared as usize, bytes.len() - 6);

    let mut cursor = &bytes[..];
    let read_back = read_pdu(&mut cursor, DEFAULT_MAX_PDU).unwrap();
    assert_eq!(read_back, pdu);
    assert_eq!(cursor.len(), 0);

    // re-encoding the decoded PDU reproduces the same bytes
    let mut bytes_again = Vec::new();
    write_pdu(&mut bytes_again, &read_back).unwrap();
    assert_eq!(bytes_again, bytes);
}

fn sample_rq() -> Pdu {
    Pdu::AssociationRQ(AssociationRQ {
        protocol_version: 1,
        called_ae_title: "THIS-SCP".to_string(),
        calling_ae_title: "THIS-SCU".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![
            PresentationContextProposed {
                id: 1,
                abstract_syntax: "1.2.840.10008.1.1".to_string(),
                transfer_syntaxes: vec![
                    "1.2.840.10008.1.2".to_string(),
                    "1.2.840.10008.1.2.1".to_string(),
                ],
            },
            PresentationContextProposed {
                id: 3,
                abstract_syntax: "1.2.840.10008.5.1.4.1.1.7".to_string(),
                transfer_syntaxes: vec!["1.2.840.10008.1.2".to_string()],
            },
        ],
        user_variables: vec![
            UserVariableItem::MaxLength(16_384),
            UserVariableItem::ImplementationClassUID(crate::IMPLEMENTATION_CLASS_UID.to_string()),
            UserVariableItem::ImplementationVersionName(
                crate::IMPLEMENTATION_VERSION_NAME.to_string(),
            ),
        ],
    })
}

#[test]
fn roundtrip_association_rq() {
    roundtrip(sample_rq());
}

#[test]
fn roundtrip_association_ac() {
    roundtrip(Pdu::AssociationAC(AssociationAC {
        protocol_version: 1,
        called_ae_title: "THIS-SCP".to_string(),
        calling_ae_title: "THIS-SCU".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![
            PresentationContextResult {
                id: 1,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            },
            PresentationContextResult {
                id: 3,
                reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            },
        ],
        user_variables: vec![UserVariableItem::MaxLength(4 << 20)],
    }));
}

#[test]
fn roundtrip_user_variables_async_and_role() {
    // async-operations (0x53) and role-selection (0x54) sub-items
    // on both sides of the negotiation
    let Pdu::AssociationRQ(mut rq) = sample_rq() else {
        panic!("sample_rq is an A-ASSOCIATE-RQ");
    };
    rq.user_variables.push(UserVariableItem::AsyncOperations(1, 1));
    rq.user_variables.push(UserVariableItem::RoleSelection {
        sop_class_uid: "1.2.840.10008.5.1.4.1.1.7".to_string(),
        scu_role: 1,
        scp_role: 0,
    });
    roundtrip(Pdu::AssociationRQ(rq));

    roundtrip(Pdu::AssociationAC(AssociationAC {
        protocol_version: 1,
        called_ae_title: "THIS-SCP".to_string(),
        calling_ae_title: "THIS-SCU".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![PresentationContextResult {
            id: 1,
            reason: PresentationContextResultReason::Acceptance,
            transfer_syntax: "1.2.840.10008.1.2".to_string(),
        }],
        user_variables: vec![
            UserVariableItem::MaxLength(16_384),
            UserVariableItem::AsyncOperations(1, 1),
            UserVariableItem::RoleSelection {
                sop_class_uid: "1.2.840.10008.1.1".to_string(),
                scu_role: 0,
                scp_role: 1,
            },
        ],
    }));
}

#[test]
fn roundtrip_association_rj() {
    roundtrip(Pdu::AssociationRJ(AssociationRJ {
        result: AssociationRJResult::Permanent,
        source: AssociationRJSource::ServiceUser(
            AssociationRJServiceUserReason::CalledAETitleNotRecognized,
        ),
    }));
}

#[test]
fn roundtrip_pdata() {
    roundtrip(Pdu::PData {
        data: vec![
            PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Command,
                is_last: true,
                data: (0..64).collect(),
            },
            PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Data,
                is_last: false,
                data: vec![0x55; 300],
            },
        ],
    });
}

#[test]
fn roundtrip_release_and_abort() {
    roundtrip(Pdu::ReleaseRQ);
    roundtrip(Pdu::ReleaseRP);
    roundtrip(Pdu::AbortRQ {
        source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnexpectedPdu),
    });
    roundtrip(Pdu::AbortRQ {
        source: AbortRQSource::ServiceUser,
    });
}

#[test]
fn roundtrip_unknown() {
    roundtrip(Pdu::Unknown {
        pdu_type: 0xAA,
        data: vec![1, 2, 3, 4],
    });
}

#[test]
fn odd_uids_are_padded_to_even_length() {
    // 17 characters; the encoded sub-item must be 18 bytes long
    let uid = "1.2.840.10008.1.1";
    assert_eq!(uid.len() % 2, 1);

    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &sample_rq()).unwrap();

    // every 16-bit item length must be even for UID payloads;
    // cheap check: the padded UID value followed by NUL is present
    let mut padded = uid.as_bytes().to_vec();
    padded.push(0);
    assert!(bytes
        .windows(padded.len())
        .any(|window| window == padded.as_slice()));
}

#[test]
fn pdu_length_over_limit_is_rejected() {
    let mut bytes = Vec::new();
    write_pdu(
        &mut bytes,
        &Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Data,
                is_last: true,
                data: vec![0; 8_192],
            }],
        },
    )
    .unwrap();

    // limit below the actual PDU length (but above the protocol minimum)
    let err = read_pdu(&mut &bytes[..], MINIMUM_PDU_SIZE).unwrap_err();
    assert!(matches!(err, ReadError::PduTooLarge { .. }));
}

#[test]
fn bad_uid_charset_is_rejected() {
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &sample_rq()).unwrap();

    // corrupt the first byte of the application context name payload
    let needle = b"1.2.840.10008.3.1.1.1";
    let pos = bytes
        .windows(needle.len())
        .position(|window| window == needle)
        .unwrap();
    bytes[pos] = b'x';

    let err = read_pdu(&mut &bytes[..], DEFAULT_MAX_PDU).unwrap_err();
    assert!(matches!(err, ReadError::InvalidUid { .. }));
}

#[test]
fn no_pdu_available_on_clean_eof() {
    let err = read_pdu(&mut &[][..], DEFAULT_MAX_PDU).unwrap_err();
    assert!(matches!(err, ReadError::NoPduAvailable { .. }));
}

#[test]
fn truncated_pdu_is_an_error() {
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &sample_rq()).unwrap();
    bytes.truncate(bytes.len() - 10);

    assert!(read_pdu(&mut &bytes[..], DEFAULT_MAX_PDU).is_err());
}
