//! C-STORE scenarios: small objects and fragmented transfers.

use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};
use std::thread;

use dicom_core::{dicom_value, DataElement, PrimitiveValue, VR};
use dicom_dictionary_std::tags;
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_net::dimse::Status;
use dicom_net::provider::ServiceProviderOptions;
use dicom_net::user::ServiceUserOptions;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;

static SCP_AE_TITLE: &str = "STORE-SCP";
static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
static SECONDARY_CAPTURE: &str = "1.2.840.10008.5.1.4.1.1.7";

#[derive(Debug, Clone)]
struct StoredObject {
    transfer_syntax: String,
    sop_class_uid: String,
    sop_instance_uid: String,
    data: Vec<u8>,
}

fn spawn_scp(max_pdu_length: u32, store: Arc<Mutex<Vec<StoredObject>>>) -> SocketAddr {
    let provider = ServiceProviderOptions::new()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(SECONDARY_CAPTURE)
        .max_pdu_length(max_pdu_length)
        .on_c_store(move |ts, sop_class, sop_instance, data| {
            store.lock().unwrap().push(StoredObject {
                transfer_syntax: ts.to_string(),
                sop_class_uid: sop_class.to_string(),
                sop_instance_uid: sop_instance.to_string(),
                data: data.to_vec(),
            });
            Status::success()
        })
        .build();

    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        provider.run(stream);
    });
    addr
}

fn sample_object(sop_instance_uid: &str, payload_length: usize) -> InMemDicomObject {
    let mut obj = InMemDicomObject::new_empty();
    obj.put(DataElement::new(
        tags::SOP_CLASS_UID,
        VR::UI,
        dicom_value!(Str, SECONDARY_CAPTURE),
    ));
    obj.put(DataElement::new(
        tags::SOP_INSTANCE_UID,
        VR::UI,
        dicom_value!(Str, sop_instance_uid),
    ));
    obj.put(DataElement::new(
        tags::PATIENT_NAME,
        VR::PN,
        dicom_value!(Str, "Doe^John"),
    ));
    if payload_length > 0 {
        let payload: Vec<u8> = (0..payload_length).map(|i| i as u8).collect();
        obj.put(DataElement::new(
            tags::PIXEL_DATA,
            VR::OW,
            PrimitiveValue::from(payload),
        ));
    }
    obj
}

fn encoded(obj: &InMemDicomObject, transfer_syntax: &str) -> Vec<u8> {
    let ts = TransferSyntaxRegistry.get(transfer_syntax).unwrap();
    let mut bytes = Vec::new();
    obj.write_dataset_with_ts(&mut bytes, ts).unwrap();
    bytes
}

#[test]
fn store_small_object() {
    let store = Arc::new(Mutex::new(Vec::new()));
    let addr = spawn_scp(16_384, Arc::clone(&store));

    let object = sample_object("1.2.3.4.5.1", 400);

    let mut scu = ServiceUserOptions::new()
        .calling_ae_title("STORE-SCU")
        .called_ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(SECONDARY_CAPTURE)
        .with_transfer_syntax(IMPLICIT_VR_LE)
        .establish(addr.to_string())
        .unwrap();

    let status = scu.c_store(&object).unwrap();
    assert!(status.is_success());
    scu.release().unwrap();

    let stored = store.lock().unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].transfer_syntax, IMPLICIT_VR_LE);
    assert_eq!(stored[0].sop_class_uid, SECONDARY_CAPTURE);
    assert_eq!(stored[0].sop_instance_uid, "1.2.3.4.5.1");
    // the data set arrives exactly as encoded by the sender
    assert_eq!(stored[0].data, encoded(&object, IMPLICIT_VR_LE));
}

#[test]
fn store_fragmented_at_small_max_pdu() {
    let store = Arc::new(Mutex::new(Vec::new()));
    // the acceptor advertises a 256-byte maximum PDU length,
    // forcing the 4 KiB data set into many fragments
    let addr = spawn_scp(256, Arc::clone(&store));

    let object = sample_object("1.2.3.4.5.2", 4096);

    let mut scu = ServiceUserOptions::new()
        .calling_ae_title("STORE-SCU")
        .called_ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(SECONDARY_CAPTURE)
        .with_transfer_syntax(IMPLICIT_VR_LE)
        .establish(addr.to_string())
        .unwrap();

    assert_eq!(scu.peer_max_pdu_length(), 256);

    let status = scu.c_store(&object).unwrap();
    assert!(status.is_success());
    scu.release().unwrap();

    let stored = store.lock().unwrap();
    assert_eq!(stored.len(), 1);
    assert!(stored[0].data.len() > 4096);
    assert_eq!(stored[0].data, encoded(&object, IMPLICIT_VR_LE));
}

#[test]
fn store_without_handler_is_unrecognized() {
    let provider = ServiceProviderOptions::new()
        .ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(SECONDARY_CAPTURE)
        .build();
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        provider.run(stream);
    });

    let mut scu = ServiceUserOptions::new()
        .called_ae_title(SCP_AE_TITLE)
        .with_abstract_syntax(SECONDARY_CAPTURE)
        .with_transfer_syntax(IMPLICIT_VR_LE)
        .establish(addr.to_string())
        .unwrap();

    let status = scu.c_store(&sample_object("1.2.3.4.5.3", 16)).unwrap();
    assert_eq!(status.code, Status::UNRECOGNIZED_OPERATION);
    scu.release().unwrap();
}
