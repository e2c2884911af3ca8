//! End-to-end behaviour of the workflow facade.

mod common;

use chrono::NaiveDate;
use common::{statement, workflow};
use reconciliation_workflow::collaborators::Candidate;
use reconciliation_workflow::models::{
    EntityRef, PageRequest, ProposalStatus, ReconciliationAction, TransactionFilter,
    TransactionStatus,
};
use reconciliation_workflow::services::ReconciliationWorkflow;
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

fn line(i: usize, amount: &str) -> String {
    format!("2024-06-{:02};{};line {};Leverancier {};;", i % 28 + 1, amount, i, i)
}

async fn import_lines(workflow: &ReconciliationWorkflow, client: Uuid, lines: Vec<String>) -> Vec<Uuid> {
    workflow
        .import_file(client, statement(&lines), None, None)
        .await
        .unwrap();
    all_ids(workflow, client).await
}

/// Transaction ids in import order.
async fn all_ids(workflow: &ReconciliationWorkflow, client: Uuid) -> Vec<Uuid> {
    let page = workflow
        .list_transactions(client, TransactionFilter::default(), PageRequest::new(1, 200))
        .await
        .unwrap();
    let mut items = page.items;
    items.sort_by_key(|t| {
        t.description
            .trim_start_matches("line ")
            .parse::<usize>()
            .unwrap_or(usize::MAX)
    });
    items.into_iter().map(|t| t.transaction_id).collect()
}

fn candidate(entity: &str, confidence: u8) -> Candidate {
    Candidate {
        entity: EntityRef::invoice(entity),
        confidence,
        reason: "amount and date match".to_string(),
    }
}

#[tokio::test]
async fn accepting_a_proposal_matches_and_closes_siblings() {
    let (workflow, _) = workflow();
    let client = Uuid::new_v4();
    let ids = import_lines(&workflow, client, vec![line(1, "-120,00")]).await;
    let t1 = ids[0];

    workflow
        .processor()
        .record_proposals(client, vec![(t1, vec![candidate("INV-1", 92), candidate("INV-2", 40)])])
        .await
        .unwrap();
    let proposals = workflow.list_proposals(client, t1).await.unwrap();
    let p1 = proposals[0].proposal_id;
    assert_eq!(proposals[0].confidence, 92);

    let result = workflow.accept_proposal(client, p1).await.unwrap();
    assert_eq!(result.status, TransactionStatus::Matched);

    let transaction = workflow.get_transaction(client, t1).await.unwrap();
    assert_eq!(transaction.status, TransactionStatus::Matched);
    assert_eq!(transaction.link.unwrap().entity, EntityRef::invoice("INV-1"));

    let proposals = workflow.list_proposals(client, t1).await.unwrap();
    let p1_now = proposals.iter().find(|p| p.proposal_id == p1).unwrap();
    assert_eq!(p1_now.status, ProposalStatus::Accepted);
    assert!(proposals
        .iter()
        .filter(|p| p.proposal_id != p1)
        .all(|p| p.status == ProposalStatus::Rejected));

    let sibling = proposals.iter().find(|p| p.proposal_id != p1).unwrap();
    let err = workflow
        .accept_proposal(client, sibling.proposal_id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "proposal_not_pending");
}

#[tokio::test]
async fn reimporting_overlapping_statement_skips_duplicates() {
    let (workflow, _) = workflow();
    let client = Uuid::new_v4();
    let lines: Vec<String> = (0..10).map(|i| line(i, "-15,00")).collect();

    workflow
        .import_file(client, statement(&lines[..3]), None, None)
        .await
        .unwrap();
    let summary = workflow
        .import_file(client, statement(&lines), None, None)
        .await
        .unwrap();

    assert_eq!(summary.imported_count, 7);
    assert_eq!(summary.skipped_duplicates_count, 3);

    let page = workflow
        .list_transactions(
            client,
            TransactionFilter {
                status: Some(TransactionStatus::New),
                query: None,
            },
            PageRequest::new(1, 50),
        )
        .await
        .unwrap();
    assert_eq!(page.total_count, 10);
}

#[tokio::test]
async fn created_expense_outlives_unmatch() {
    let (workflow, entities) = workflow();
    let client = Uuid::new_v4();
    let ids = import_lines(&workflow, client, vec![line(2, "-45,99")]).await;
    let t2 = ids[0];

    let result = workflow
        .apply_action(client, t2, ReconciliationAction::create_expense("kantoorkosten", 21))
        .await
        .unwrap();
    assert_eq!(result.status, TransactionStatus::Matched);
    let expense = EntityRef::expense(result.created_entity_id.unwrap().parse().unwrap());
    assert_eq!(entities.expense_count(client), 1);
    assert_eq!(
        workflow.get_transaction(client, t2).await.unwrap().link.unwrap().entity,
        expense
    );

    let undone = workflow
        .apply_action(client, t2, ReconciliationAction::unmatch())
        .await
        .unwrap();
    assert_eq!(undone.status, TransactionStatus::New);
    assert!(workflow.get_transaction(client, t2).await.unwrap().link.is_none());
    assert!(entities.find(client, &expense).is_some());
}

#[tokio::test]
async fn second_page_of_needs_review() {
    let (workflow, _) = workflow();
    let client = Uuid::new_v4();
    let lines = (0..130).map(|i| line(i, "-10,00")).collect();
    let ids = import_lines(&workflow, client, lines).await;

    let suggestions = ids[..120]
        .iter()
        .enumerate()
        .map(|(i, id)| (*id, vec![candidate(&format!("INV-{}", i), 75)]))
        .collect();
    let created = workflow
        .processor()
        .record_proposals(client, suggestions)
        .await
        .unwrap();
    assert_eq!(created, 120);

    let filter = TransactionFilter {
        status: Some(TransactionStatus::NeedsReview),
        query: None,
    };
    let page = workflow
        .list_transactions(client, filter.clone(), PageRequest::new(2, 50))
        .await
        .unwrap();
    let everything = workflow
        .list_transactions(client, filter, PageRequest::new(1, 200))
        .await
        .unwrap();

    assert_eq!(page.total_count, 120);
    assert_eq!(page.items.len(), 50);
    assert_eq!(page.items, everything.items[50..100].to_vec());
}

#[tokio::test]
async fn unmatch_after_match_restores_without_touching_amounts() {
    let (workflow, entities) = workflow();
    let client = Uuid::new_v4();
    let ids = import_lines(&workflow, client, vec![line(5, "-1.234,56")]).await;
    let invoice = entities.register_invoice(
        client,
        "INV-7",
        Decimal::new(-123456, 2),
        NaiveDate::from_ymd_opt(2024, 6, 3).unwrap(),
    );
    let before = workflow.get_transaction(client, ids[0]).await.unwrap();

    workflow
        .apply_action(client, ids[0], ReconciliationAction::apply_match(invoice))
        .await
        .unwrap();
    workflow
        .apply_action(client, ids[0], ReconciliationAction::unmatch())
        .await
        .unwrap();

    let after = workflow.get_transaction(client, ids[0]).await.unwrap();
    assert_eq!(after.status, TransactionStatus::New);
    assert!(after.link.is_none());
    assert_eq!(after.amount, before.amount);
    assert_eq!(after.booking_date, before.booking_date);
    assert_eq!(after.description, before.description);
    assert_eq!(after.amount, Decimal::new(-123456, 2));
}

#[tokio::test]
async fn ignoring_twice_keeps_ignored() {
    let (workflow, _) = workflow();
    let client = Uuid::new_v4();
    let ids = import_lines(&workflow, client, vec![line(3, "-2,50")]).await;

    for _ in 0..2 {
        let result = workflow
            .apply_action(client, ids[0], ReconciliationAction::ignore())
            .await
            .unwrap();
        assert_eq!(result.status, TransactionStatus::Ignored);
    }
}

#[tokio::test]
async fn generated_proposals_reach_matched_through_the_engine() {
    let (workflow, entities) = workflow();
    let client = Uuid::new_v4();
    entities.register_invoice(
        client,
        "2024-031",
        Decimal::new(121000, 2),
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
    );
    let ids = import_lines(
        &workflow,
        client,
        vec!["2024-06-03;1.210,00;Factuur 2024-031;Klant BV;NL91ABNA0417164300;2024-031".to_string()],
    )
    .await;

    let outcome = workflow.generate_proposals(client).await.unwrap();
    assert_eq!(outcome.created_count, 1);
    assert_eq!(
        workflow.get_transaction(client, ids[0]).await.unwrap().status,
        TransactionStatus::NeedsReview
    );

    let proposal = workflow.list_proposals(client, ids[0]).await.unwrap().remove(0);
    workflow
        .accept_proposal(client, proposal.proposal_id)
        .await
        .unwrap();

    let kpi = workflow
        .compute_kpi_as_of(client, NaiveDate::from_ymd_opt(2024, 6, 30).unwrap())
        .await
        .unwrap();
    assert_eq!(kpi.matched_percentage_30d, 100.0);
    assert_eq!(kpi.unmatched_count, 0);
    assert_eq!(kpi.total_inflow, Decimal::new(121000, 2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_accepts_book_the_line_once() {
    let (workflow, _) = workflow();
    let client = Uuid::new_v4();
    let ids = import_lines(&workflow, client, vec![line(1, "-120,00")]).await;
    workflow
        .processor()
        .record_proposals(client, vec![(ids[0], vec![candidate("INV-1", 92), candidate("INV-2", 91)])])
        .await
        .unwrap();
    let proposals = workflow.list_proposals(client, ids[0]).await.unwrap();

    let handles: Vec<_> = proposals
        .iter()
        .map(|p| {
            let workflow = Arc::clone(&workflow);
            let proposal_id = p.proposal_id;
            tokio::spawn(async move { workflow.accept_proposal(client, proposal_id).await })
        })
        .collect();

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap());
    }

    assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1);
    for err in outcomes.into_iter().filter_map(Result::err) {
        assert!(matches!(
            err.kind(),
            "proposal_not_pending" | "transaction_already_matched"
        ));
    }

    let proposals = workflow.list_proposals(client, ids[0]).await.unwrap();
    assert_eq!(
        proposals
            .iter()
            .filter(|p| p.status == ProposalStatus::Accepted)
            .count(),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_entity_is_never_linked_to_two_transactions() {
    let (workflow, entities) = workflow();
    let client = Uuid::new_v4();
    let ids = import_lines(&workflow, client, (0..4).map(|i| line(i, "-99,00")).collect()).await;
    let invoice = entities.register_invoice(
        client,
        "INV-99",
        Decimal::new(-9900, 2),
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
    );

    let handles: Vec<_> = ids
        .iter()
        .map(|id| {
            let workflow = Arc::clone(&workflow);
            let action = ReconciliationAction::apply_match(invoice.clone());
            let id = *id;
            tokio::spawn(async move { workflow.apply_action(client, id, action).await })
        })
        .collect();

    let mut succeeded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(e) => assert_eq!(e.kind(), "entity_already_linked"),
        }
    }
    assert_eq!(succeeded, 1);

    let matched = workflow
        .list_transactions(
            client,
            TransactionFilter {
                status: Some(TransactionStatus::Matched),
                query: None,
            },
            PageRequest::new(1, 50),
        )
        .await
        .unwrap();
    assert_eq!(matched.total_count, 1);
}
