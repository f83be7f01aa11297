use ayurtrace_core::{
    CancelToken, Collection, CollectionEvent, DbError, Gateway, GatewayProvenanceRepository,
    GeoBoundingBox, ObjectId, ProcessingStep, ProvenanceError, ProvenanceService, QrDoc,
    RecordCollectionEventRequest, RecordProcessingStepRequest, RepoError, StoreConfig,
    ValidationError,
};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;

fn memory_gateway() -> Gateway {
    Gateway::connect(&StoreConfig::in_memory("provenance")).unwrap()
}

fn service(gateway: &Gateway) -> ProvenanceService<GatewayProvenanceRepository<'_>> {
    ProvenanceService::new(GatewayProvenanceRepository::new(gateway))
}

fn ashwagandha_request() -> RecordCollectionEventRequest {
    RecordCollectionEventRequest {
        collector_id: Some("c001".to_string()),
        species: Some("Ashwagandha".to_string()),
        quality_metrics: Some("moisture=8%".to_string()),
        latitude: Some(26.9),
        longitude: Some(75.8),
    }
}

fn step_request(event_id: &str, step_name: &str) -> RecordProcessingStepRequest {
    RecordProcessingStepRequest {
        collection_event_id: Some(event_id.to_string()),
        step_name: Some(step_name.to_string()),
    }
}

#[test]
fn collection_event_step_and_unknown_qr_scenario() {
    let gateway = memory_gateway();
    let service = service(&gateway);

    let event_id = service
        .record_collection_event(&ashwagandha_request())
        .unwrap();
    assert_eq!(event_id.to_hex().len(), 24);

    let step_id = service
        .record_processing_step(&step_request(&event_id.to_hex(), "Drying"))
        .unwrap();
    assert_ne!(step_id, event_id);

    let err = service.resolve_qr_code("QR-NOPE").unwrap_err();
    assert!(matches!(err, ProvenanceError::NotFound { .. }));
    assert!(err.is_client_error());
}

#[test]
fn recorded_event_is_stored_longitude_first_with_server_timestamp() {
    let gateway = memory_gateway();
    let service = service(&gateway);
    let before_ms = ObjectId::new().timestamp_secs() as i64 * 1000;

    let id = service
        .record_collection_event(&ashwagandha_request())
        .unwrap();

    let stored: serde_json::Value = gateway
        .find_one_by_field(Collection::CollectionEvents, "_id", &json!(id.to_hex()))
        .unwrap()
        .unwrap();
    assert_eq!(stored["location"]["type"], "Point");
    assert_eq!(stored["location"]["coordinates"], json!([75.8, 26.9]));
    assert_eq!(stored["quality_metrics"], "moisture=8%");
    assert!(stored["ts"].as_i64().unwrap() >= before_ms);

    let event = service.collection_event(&id.to_hex()).unwrap();
    assert_eq!(event.location.longitude(), 75.8);
    assert_eq!(event.location.latitude(), 26.9);
    assert_eq!(event.species, "Ashwagandha");
}

#[test]
fn every_recorded_event_gets_a_fresh_identifier() {
    let gateway = memory_gateway();
    let service = service(&gateway);

    let ids: HashSet<ObjectId> = (0..50)
        .map(|_| service.record_collection_event(&ashwagandha_request()).unwrap())
        .collect();
    assert_eq!(ids.len(), 50);
    assert_eq!(
        gateway.count_documents(Collection::CollectionEvents).unwrap(),
        50
    );
}

#[test]
fn incomplete_collection_events_are_rejected_without_writes() {
    let gateway = memory_gateway();
    let service = service(&gateway);

    let incomplete = [
        RecordCollectionEventRequest {
            collector_id: None,
            ..ashwagandha_request()
        },
        RecordCollectionEventRequest {
            species: None,
            ..ashwagandha_request()
        },
        RecordCollectionEventRequest {
            latitude: None,
            ..ashwagandha_request()
        },
        RecordCollectionEventRequest {
            longitude: None,
            ..ashwagandha_request()
        },
        RecordCollectionEventRequest {
            collector_id: Some("  ".to_string()),
            ..ashwagandha_request()
        },
        RecordCollectionEventRequest {
            longitude: Some(181.0),
            ..ashwagandha_request()
        },
        RecordCollectionEventRequest::default(),
    ];

    for request in &incomplete {
        let err = service.record_collection_event(request).unwrap_err();
        assert!(
            matches!(err, ProvenanceError::Validation(_)),
            "unexpected error for {request:?}: {err}"
        );
    }
    assert_eq!(
        gateway.count_documents(Collection::CollectionEvents).unwrap(),
        0
    );
}

#[test]
fn malformed_event_references_fail_validation_before_any_write() {
    let gateway = memory_gateway();
    let service = service(&gateway);

    for raw in ["", "xyz", "65a1b2c3d4e5f60718293a4", "65a1b2c3d4e5f60718293a4bcc", "g5a1b2c3d4e5f60718293a4b"] {
        let err = service
            .record_processing_step(&step_request(raw, "Drying"))
            .unwrap_err();
        match err {
            ProvenanceError::Validation(ValidationError::InvalidObjectId { field, .. }) => {
                assert_eq!(field, "collection_event_id");
            }
            other => panic!("unexpected error for `{raw}`: {other}"),
        }
    }

    let err = service
        .record_processing_step(&step_request(&ObjectId::new().to_hex(), " "))
        .unwrap_err();
    assert!(matches!(
        err,
        ProvenanceError::Validation(ValidationError::EmptyField("step_name"))
    ));

    let err = service
        .record_processing_step(&RecordProcessingStepRequest {
            collection_event_id: None,
            step_name: Some("Drying".to_string()),
        })
        .unwrap_err();
    assert!(matches!(
        err,
        ProvenanceError::Validation(ValidationError::MissingField("collection_event_id"))
    ));

    assert_eq!(
        gateway.count_documents(Collection::ProcessingSteps).unwrap(),
        0
    );
}

#[test]
fn dangling_event_reference_is_stored_verbatim() {
    let gateway = memory_gateway();
    let service = service(&gateway);
    let never_recorded = ObjectId::new();

    let step_id = service
        .record_processing_step(&step_request(&never_recorded.to_hex(), "Drying"))
        .unwrap();

    let stored: ProcessingStep = gateway
        .find_one_by_field(Collection::ProcessingSteps, "_id", &json!(step_id.to_hex()))
        .unwrap()
        .unwrap();
    assert_eq!(stored.collection_event_id, never_recorded);
    assert_eq!(stored.step_name, "Drying");

    let err = service
        .collection_event(&never_recorded.to_hex())
        .unwrap_err();
    assert!(matches!(err, ProvenanceError::NotFound { .. }));

    let trail = service.provenance_trail(&never_recorded.to_hex()).unwrap();
    assert!(trail.is_dangling());
    assert_eq!(trail.steps, vec![stored]);
}

#[test]
fn provenance_trail_resolves_event_and_ordered_steps() {
    let gateway = memory_gateway();
    let service = service(&gateway);
    let event_id = service
        .record_collection_event(&ashwagandha_request())
        .unwrap()
        .to_hex();

    for name in ["Washing", "Drying", "Grinding"] {
        service
            .record_processing_step(&step_request(&event_id, name))
            .unwrap();
    }
    let other = service
        .record_collection_event(&ashwagandha_request())
        .unwrap()
        .to_hex();
    service
        .record_processing_step(&step_request(&other, "Packing"))
        .unwrap();

    let trail = service.provenance_trail(&event_id.to_uppercase()).unwrap();
    assert!(!trail.is_dangling());
    assert_eq!(trail.event.unwrap().collector_id, "c001");
    let names: Vec<String> = trail.steps.into_iter().map(|step| step.step_name).collect();
    assert_eq!(names, ["Washing", "Drying", "Grinding"]);
}

#[test]
fn provenance_trail_lists_every_step_of_a_long_chain() {
    let gateway = memory_gateway();
    let service = service(&gateway);
    let event_id = service
        .record_collection_event(&ashwagandha_request())
        .unwrap();

    for n in 0..1_201 {
        gateway
            .insert_one(
                Collection::ProcessingSteps,
                &ProcessingStep::new(event_id, format!("Step {n}"), n),
            )
            .unwrap();
    }

    let trail = service.provenance_trail(&event_id.to_hex()).unwrap();
    assert!(!trail.is_dangling());
    assert_eq!(trail.steps.len(), 1_201);
    assert_eq!(trail.steps[0].step_name, "Step 0");
    assert_eq!(trail.steps[1_200].step_name, "Step 1200");
}

#[test]
fn cancelled_request_is_reported_as_server_error() {
    let gateway = memory_gateway();
    let token = CancelToken::new();
    let service = ProvenanceService::new(GatewayProvenanceRepository::with_cancel(
        &gateway,
        token.clone(),
    ));
    token.cancel();

    let err = service
        .record_collection_event(&ashwagandha_request())
        .unwrap_err();
    assert!(!err.is_client_error());
    assert!(matches!(
        err,
        ProvenanceError::Repo(RepoError::Db(DbError::Cancelled { .. }))
    ));

    // Other requests on the same gateway are unaffected.
    let other = self::service(&gateway);
    other
        .record_collection_event(&ashwagandha_request())
        .unwrap();
    assert_eq!(
        gateway.count_documents(Collection::CollectionEvents).unwrap(),
        1
    );
}

#[test]
fn resolve_qr_code_returns_stored_payload_verbatim() {
    let gateway = memory_gateway();
    gateway
        .insert_one(
            Collection::QrCodes,
            &QrDoc::new(
                "ABC123",
                Some("Ashwagandha Root Powder".to_string()),
                Some("Collected by c001 near Jaipur; dried; ground.".to_string()),
            ),
        )
        .unwrap();
    gateway
        .insert_one(Collection::QrCodes, &QrDoc::new("BARE", None, None))
        .unwrap();
    let service = service(&gateway);

    let payload = service.resolve_qr_code("ABC123").unwrap();
    assert_eq!(
        payload.product_name.as_deref(),
        Some("Ashwagandha Root Powder")
    );
    assert_eq!(
        payload.traceability_data.as_deref(),
        Some("Collected by c001 near Jaipur; dried; ground.")
    );

    let bare = service.resolve_qr_code("BARE").unwrap();
    assert_eq!(bare.product_name, None);
    assert_eq!(bare.traceability_data, None);

    assert!(matches!(
        service.resolve_qr_code("ABC12").unwrap_err(),
        ProvenanceError::NotFound { .. }
    ));
}

#[test]
fn collection_events_within_area() {
    let gateway = memory_gateway();
    let service = service(&gateway);
    let near = service
        .record_collection_event(&ashwagandha_request())
        .unwrap();
    service
        .record_collection_event(&RecordCollectionEventRequest {
            latitude: Some(9.93),
            longitude: Some(76.26),
            ..ashwagandha_request()
        })
        .unwrap();

    let around_jaipur = GeoBoundingBox::new(75.5, 26.5, 76.0, 27.5).unwrap();
    let found: Vec<CollectionEvent> = service.collection_events_within(&around_jaipur).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, Some(near));

    let inverted = GeoBoundingBox {
        west: 10.0,
        south: 0.0,
        east: 5.0,
        north: 1.0,
    };
    assert!(matches!(
        service.collection_events_within(&inverted).unwrap_err(),
        ProvenanceError::Validation(ValidationError::InvertedBoundingBox { .. })
    ));
}

#[test]
fn concurrent_workers_share_one_gateway() {
    let gateway = Arc::new(memory_gateway());
    let workers = 8;
    let per_worker = 25;

    let handles: Vec<_> = (0..workers)
        .map(|worker| {
            let gateway = Arc::clone(&gateway);
            std::thread::spawn(move || {
                let service = service(&gateway);
                (0..per_worker)
                    .map(|n| {
                        let event_id = service
                            .record_collection_event(&RecordCollectionEventRequest {
                                collector_id: Some(format!("c{worker:03}")),
                                ..ashwagandha_request()
                            })
                            .unwrap();
                        service
                            .record_processing_step(&step_request(
                                &event_id.to_hex(),
                                &format!("Step {n}"),
                            ))
                            .unwrap();
                        event_id
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut ids = HashSet::new();
    for handle in handles {
        ids.extend(handle.join().unwrap());
    }

    let expected = (workers * per_worker) as u64;
    assert_eq!(ids.len() as u64, expected);
    assert_eq!(
        gateway.count_documents(Collection::CollectionEvents).unwrap(),
        expected
    );
    assert_eq!(
        gateway.count_documents(Collection::ProcessingSteps).unwrap(),
        expected
    );
}

#[test]
fn store_failures_surface_as_server_errors() {
    let gateway = memory_gateway();
    let service = service(&gateway);
    gateway.close();

    let err = service
        .record_collection_event(&ashwagandha_request())
        .unwrap_err();
    assert!(!err.is_client_error());
    assert!(matches!(err, ProvenanceError::Repo(RepoError::Db(DbError::Closed))));

    let err = service.resolve_qr_code("ABC123").unwrap_err();
    assert!(matches!(err, ProvenanceError::Repo(RepoError::Db(DbError::Closed))));
}
