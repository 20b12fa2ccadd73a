//! Screening endpoints: cache-aside reads, admin writes, submissions.

mod common;

use axum::http::StatusCode;
use common::*;
use neurodyx_backend_lib::storage::DocumentStore;
use serde_json::json;

#[tokio::test]
async fn test_admin_writes_are_visible_immediately() {
    let env = setup_test_env();
    let (access, _) = login(&env.app, ADA_FIREBASE_TOKEN, "firebase").await;
    make_admin(&env.store, "ada").await;

    // Prime the cache with an empty list
    let (status, body) = send(
        &env.app,
        empty_request("GET", "/api/screening/questions?ageGroup=kids", Some(&access)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));

    let (status, body) = send(
        &env.app,
        json_request(
            "POST",
            "/api/screening/questions",
            Some(&access),
            json!({"ageGroup": "kids", "question": "Does your child mix up b and d?"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["questionID"].as_str().unwrap().to_string();

    let (_, body) = send(
        &env.app,
        empty_request("GET", "/api/screening/questions?ageGroup=kids", Some(&access)),
    )
    .await;
    assert_eq!(body[0]["id"], json!(id));

    let (status, _) = send(
        &env.app,
        json_request(
            "PUT",
            &format!("/api/screening/questions/{id}"),
            Some(&access),
            json!({"ageGroup": "kids", "question": "Reworded"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, body) = send(
        &env.app,
        empty_request("GET", "/api/screening/questions?ageGroup=kids", Some(&access)),
    )
    .await;
    assert_eq!(body[0]["question"], json!("Reworded"));

    let (status, _) = send(
        &env.app,
        empty_request(
            "DELETE",
            &format!("/api/screening/questions/{id}?ageGroup=kids"),
            Some(&access),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, body) = send(
        &env.app,
        empty_request("GET", "/api/screening/questions?ageGroup=kids", Some(&access)),
    )
    .await;
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn test_non_admin_cannot_write() {
    let env = setup_test_env();
    let (access, _) = login(&env.app, BOB_GOOGLE_TOKEN, "google").await;

    let (status, body) = send(
        &env.app,
        json_request(
            "POST",
            "/api/screening/questions",
            Some(&access),
            json!({"ageGroup": "kids", "question": "q"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], json!("AUTH_003"));

    // Reads are open to any authenticated user
    let (status, _) = send(
        &env.app,
        empty_request("GET", "/api/screening/questions?ageGroup=kids", Some(&access)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_protected_routes_need_a_credential() {
    let env = setup_test_env();
    let (status, body) = send(
        &env.app,
        empty_request("GET", "/api/screening/questions?ageGroup=kids", None),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], json!("AUTH_002"));
}

#[tokio::test]
async fn test_submit_screening() {
    let env = setup_test_env();
    let (access, _) = login(&env.app, ADA_FIREBASE_TOKEN, "firebase").await;
    make_admin(&env.store, "ada").await;

    for text in ["q1", "q2", "q3", "q4"] {
        let (status, _) = send(
            &env.app,
            json_request(
                "POST",
                "/api/screening/questions",
                Some(&access),
                json!({"ageGroup": "teens", "question": text}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    // Wrong answer count
    let (status, _) = send(
        &env.app,
        json_request(
            "POST",
            "/api/screening/submit",
            Some(&access),
            json!({"ageGroup": "teens", "answers": [true]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &env.app,
        json_request(
            "POST",
            "/api/screening/submit",
            Some(&access),
            json!({"ageGroup": "teens", "answers": [true, true, true, false]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"riskLevel": "high"}));

    let doc = env.store.get("users/ada/screenings/current").await.unwrap().unwrap();
    assert_eq!(doc["riskLevel"], json!("high"));
}

#[tokio::test]
async fn test_list_without_age_group_spans_groups() {
    let env = setup_test_env();
    let (access, _) = login(&env.app, ADA_FIREBASE_TOKEN, "firebase").await;
    make_admin(&env.store, "ada").await;

    for (age_group, text) in [("kids", "k1"), ("adults", "a1"), ("adults", "a2")] {
        let (status, _) = send(
            &env.app,
            json_request(
                "POST",
                "/api/screening/questions",
                Some(&access),
                json!({"ageGroup": age_group, "question": text}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, body) = send(
        &env.app,
        empty_request("GET", "/api/screening/questions", Some(&access)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let groups: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|q| q["ageGroup"].as_str().unwrap())
        .collect();
    assert_eq!(groups, vec!["adults", "adults", "kids"]);

    // Missing ageGroup on a write is rejected with the error body
    let (status, body) = send(
        &env.app,
        json_request("POST", "/api/screening/questions", Some(&access), json!({"question": "q"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], json!("VAL_001"));
}
