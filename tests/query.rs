//! C-FIND, C-MOVE and C-GET streaming scenarios.

use std::net::{SocketAddr, TcpListener};
use std::thread;

use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_net::dimse::Status;
use dicom_net::provider::{
    RetrieveItem, ServiceProvider, ServiceProviderOptions,
};
use dicom_net::user::ServiceUserOptions;
use dicom_object::InMemDicomObject;

static SCP_AE_TITLE: &str = "QR-SCP";
static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
static STUDY_ROOT_FIND: &str = "1.2.840.10008.5.1.4.1.2.2.1";
static STUDY_ROOT_MOVE: &str = "1.2.840.10008.5.1.4.1.2.2.2";
static STUDY_ROOT_GET: &str = "1.2.840.10008.5.1.4.1.2.2.3";

fn spawn_scp(provider: ServiceProvider) -> SocketAddr {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        provider.run(stream);
    });
    addr
}

fn match_with_name(name: &str) -> InMemDicomObject {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        tags::QUERY_RETRIEVE_LEVEL,
        VR::CS,
        dicom_value!(Str, "STUDY"),
    ));
    obj.put(DataElement::new(
        tags::PATIENT_NAME,
        VR::PN,
        dicom_value!(Str, name),
    ));
    obj
}

fn query() -> InMemDicomObject {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        tags::QUERY_RETRIEVE_LEVEL,
        VR::CS,
        dicom_value!(Str, "STUDY"),
    ));
    obj.put(DataElement::new(
        tags::PATIENT_NAME,
        VR::PN,
        dicom_value!(Str, ""),
    ));
    obj
}

fn scu(addr: SocketAddr, abstract_syntax: &str) -> dicom_net::user::ServiceUser {
    ServiceUserOptions::new()
        .calling_ae_title("QR-SCU")
        .called_ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(abstract_syntax)
        .with_transfer_syntax(IMPLICIT_VR_LE)
        .establish(addr.to_string())
        .unwrap()
}

#[test]
fn find_streams_matches_in_order() {
    let provider = ServiceProviderOptions::new()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(STUDY_ROOT_FIND)
        .on_c_find(|_ts, _sop_class, _query| {
            Box::new(
                ["Adams^Ann", "Baker^Bea", "Clark^Col"]
                    .into_iter()
                    .map(|name| Ok(match_with_name(name))),
            )
        })
        .build();
    let addr = spawn_scp(provider);

    let mut scu = scu(addr, STUDY_ROOT_FIND);
    let outcome = scu.c_find(STUDY_ROOT_FIND, &query()).unwrap();

    assert!(outcome.status.is_success());
    assert_eq!(outcome.matches.len(), 3);
    // responses arrive in the order the handler produced them
    let names: Vec<String> = outcome
        .matches
        .iter()
        .map(|obj| {
            obj.get(tags::PATIENT_NAME)
                .unwrap()
                .to_str()
                .unwrap()
                .trim_end_matches([' ', '\0'])
                .to_string()
        })
        .collect();
    assert_eq!(names, ["Adams^Ann", "Baker^Bea", "Clark^Col"]);

    scu.release().unwrap();
}

#[test]
fn find_with_no_matches_is_success() {
    let provider = ServiceProviderOptions::new()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(STUDY_ROOT_FIND)
        .on_c_find(|_ts, _sop_class, _query| Box::new(std::iter::empty()))
        .build();
    let addr = spawn_scp(provider);

    let mut scu = scu(addr, STUDY_ROOT_FIND);
    let outcome = scu.c_find(STUDY_ROOT_FIND, &query()).unwrap();
    assert!(outcome.status.is_success());
    assert!(outcome.matches.is_empty());
    scu.release().unwrap();
}

#[test]
fn find_error_terminates_the_stream() {
    let provider = ServiceProviderOptions::new()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(STUDY_ROOT_FIND)
        .on_c_find(|_ts, _sop_class, _query| {
            Box::new(
                vec![
                    Ok(match_with_name("Adams^Ann")),
                    Err(Status::with_comment(
                        Status::REFUSED_UNABLE_TO_CALCULATE_MATCHES,
                        "index offline",
                    )),
                ]
                .into_iter(),
            )
        })
        .build();
    let addr = spawn_scp(provider);

    let mut scu = scu(addr, STUDY_ROOT_FIND);
    let outcome = scu.c_find(STUDY_ROOT_FIND, &query()).unwrap();
    assert_eq!(outcome.status.code, Status::REFUSED_UNABLE_TO_CALCULATE_MATCHES);
    assert_eq!(
        outcome.status.error_comment.as_deref(),
        Some("index offline")
    );
    assert_eq!(outcome.matches.len(), 1);
    scu.release().unwrap();
}

#[test]
fn move_decrements_remaining_to_zero() {
    let provider = ServiceProviderOptions::new()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(STUDY_ROOT_MOVE)
        .with_remote_ae("STORE-SCP", "localhost:11112")
        .on_c_move(|_ts, _sop_class, _query| {
            Box::new(
                vec![
                    Ok(RetrieveItem {
                        remaining: 1,
                        dataset: match_with_name("Adams^Ann"),
                    }),
                    Ok(RetrieveItem {
                        remaining: 0,
                        dataset: match_with_name("Baker^Bea"),
                    }),
                ]
                .into_iter(),
            )
        })
        .build();
    let addr = spawn_scp(provider);

    let mut scu = scu(addr, STUDY_ROOT_MOVE);
    let outcome = scu
        .c_move("STORE-SCP", STUDY_ROOT_MOVE, &query())
        .unwrap();
    assert!(outcome.status.is_success());
    assert_eq!(outcome.completed, 2);
    assert_eq!(outcome.failed, 0);
    scu.release().unwrap();
}

#[test]
fn move_to_unknown_destination_is_refused() {
    let provider = ServiceProviderOptions::new()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(STUDY_ROOT_MOVE)
        .on_c_move(|_ts, _sop_class, _query| Box::new(std::iter::empty()))
        .build();
    let addr = spawn_scp(provider);

    let mut scu = scu(addr, STUDY_ROOT_MOVE);
    let outcome = scu
        .c_move("NOWHERE", STUDY_ROOT_MOVE, &query())
        .unwrap();
    assert_eq!(outcome.status.code, Status::REFUSED_MOVE_DESTINATION_UNKNOWN);
    scu.release().unwrap();
}

#[test]
fn get_reports_suboperation_counters() {
    let provider = ServiceProviderOptions::new()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(STUDY_ROOT_GET)
        .on_c_get(|_ts, _sop_class, _query| {
            Box::new(
                (0..3u16).rev().map(|remaining| {
                    Ok(RetrieveItem {
                        remaining,
                        dataset: match_with_name("Adams^Ann"),
                    })
                }),
            )
        })
        .build();
    let addr = spawn_scp(provider);

    let mut scu = scu(addr, STUDY_ROOT_GET);
    let outcome = scu.c_get(STUDY_ROOT_GET, &query()).unwrap();
    assert!(outcome.status.is_success());
    assert_eq!(outcome.completed, 3);
    scu.release().unwrap();
}
