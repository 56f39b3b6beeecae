//! Route dispatch and the per-route handlers.
//!
//! Every handler is a pure request -> response function over the
//! shared [ServerState]; protocol-sequence and authorization failures
//! produce a status response, never a dropped connection.

use std::io::SeekFrom;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::ServerState;
use super::error::StoreError;
use crate::definitions::{key_record_name, signer_of, valid_target_name};
use crate::transfer::{PayloadKind, TransferError};
use crate::wire::{
    Body, HDR_CHUNK_ID, HDR_FILE_ID, HDR_TYPE, Kind, Message, Status, TYPE_CHUNK, TYPE_SIGNATURE,
};

/// The closed set of dispatchable routes. `authenticate` is handled
/// by the connection worker before it ever reaches dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    CreateWorkspace,
    AddUserToWorkspace,
    UploadFile,
    DownloadFile,
    UploadKey,
    DownloadKey,
    ListWorkspaces,
    ListWorkspaceFiles,
    RemoveFile,
}

impl Route {
    fn from_name(name: &str) -> Option<Route> {
        Some(match name {
            "createworkspace" => Route::CreateWorkspace,
            "addusertoworkspace" => Route::AddUserToWorkspace,
            "uploadfiletoworkspace" => Route::UploadFile,
            "downloadfilefromworkspace" => Route::DownloadFile,
            "uploadkeytoworkspace" => Route::UploadKey,
            "downloadkeyfromworkspace" => Route::DownloadKey,
            "listworkspaces" => Route::ListWorkspaces,
            "listworkspacefiles" => Route::ListWorkspaceFiles,
            "removefilefromworkspace" => Route::RemoveFile,
            _ => return None,
        })
    }
}

fn reply(request: &Message, status: Status) -> Message {
    Message::response(status, request.correlation_id.clone())
}

fn transfer_status(error: &TransferError) -> Status {
    match error {
        TransferError::NotFound(_) => Status::NotFound,
        TransferError::NotOwner(_) => Status::NoPermission,
        TransferError::AlreadyComplete(_)
        | TransferError::OutOfOrder { .. }
        | TransferError::PastEnd { .. }
        | TransferError::Incomplete(_)
        | TransferError::Declaration { .. } => Status::BadRequest,
        TransferError::Io(_) => Status::GenericFailure,
    }
}

/// Membership gate: `None` means the caller may proceed.
fn membership_failure(state: &ServerState, workspace: &str, identity: &str) -> Option<Status> {
    if !state.workspaces.exists(workspace) {
        Some(Status::NoWorkspace)
    } else if !state.workspaces.is_member(workspace, identity) {
        Some(Status::NoPermission)
    } else {
        None
    }
}

pub(crate) async fn dispatch(state: &ServerState, identity: &str, request: &Message) -> Message {
    let Kind::Request { route } = &request.kind else {
        return reply(request, Status::BadRequest);
    };

    if route == "authenticate" {
        // the connection is already bound to an identity
        return reply(request, Status::BadRequest);
    }

    let Some(route) = Route::from_name(route) else {
        tracing::debug!(%route, "unknown route");
        return reply(request, Status::NotFound);
    };

    match route {
        Route::CreateWorkspace => create_workspace(state, identity, request),
        Route::AddUserToWorkspace => add_user_to_workspace(state, identity, request),
        Route::ListWorkspaces => list_workspaces(state, identity, request),
        Route::ListWorkspaceFiles => list_workspace_files(state, identity, request),
        Route::RemoveFile => remove_file(state, identity, request),
        Route::UploadFile => handle_upload(state, identity, request, PayloadKind::File).await,
        Route::UploadKey => handle_upload(state, identity, request, PayloadKind::Key).await,
        Route::DownloadFile => handle_download(state, identity, request, PayloadKind::File).await,
        Route::DownloadKey => handle_download(state, identity, request, PayloadKind::Key).await,
    }
}

fn create_workspace(state: &ServerState, identity: &str, request: &Message) -> Message {
    let Some(workspace) = request.field("workspace") else {
        return reply(request, Status::BadRequest);
    };

    match state.workspaces.create(workspace, identity) {
        Ok(()) => {
            tracing::info!(workspace, owner = identity, "workspace created");
            reply(request, Status::Ok)
        }
        Err(StoreError::InvalidName(_)) => reply(request, Status::BadRequest),
        Err(StoreError::WorkspaceExists(_)) => {
            reply(request, Status::GenericFailure)
        }
        Err(e) => {
            tracing::warn!(workspace, "workspace creation failed: {e}");
            reply(request, Status::InternalError)
        }
    }
}

fn add_user_to_workspace(state: &ServerState, identity: &str, request: &Message) -> Message {
    let (Some(workspace), Some(member), Some(key_blob)) = (
        request.field("workspace"),
        request.field("member"),
        request.field("key"),
    ) else {
        return reply(request, Status::BadRequest);
    };

    if !state.workspaces.exists(workspace) {
        return reply(request, Status::NoWorkspace);
    }
    // membership mutation is owner-only
    if !state.workspaces.is_owner(workspace, identity) {
        return reply(request, Status::NoPermission);
    }
    if !state.users.exists(member) {
        return reply(request, Status::NoUser);
    }

    // the wrapped key record for the new member must already be in
    // place; membership without a key would be unusable
    if key_blob != key_record_name(workspace, member) {
        return reply(request, Status::BadRequest);
    }
    match state.workspaces.key_path(key_blob) {
        Some(path) if path.exists() => {}
        _ => return reply(request, Status::BadRequest),
    }

    match state.workspaces.add_member(workspace, member) {
        Ok(()) => {
            tracing::info!(workspace, member, "member added");
            reply(request, Status::Ok)
        }
        Err(e) => {
            tracing::warn!(workspace, member, "membership update failed: {e}");
            reply(request, Status::InternalError)
        }
    }
}

fn list_workspaces(state: &ServerState, identity: &str, request: &Message) -> Message {
    let names = state.workspaces.list_for(identity);
    reply(request, Status::Ok).with_field("workspaces", names.join(","))
}

fn list_workspace_files(state: &ServerState, identity: &str, request: &Message) -> Message {
    let Some(workspace) = request.field("workspace") else {
        return reply(request, Status::BadRequest);
    };
    if let Some(status) = membership_failure(state, workspace, identity) {
        return reply(request, status);
    }

    match state.workspaces.list_files(workspace) {
        Ok(names) => reply(request, Status::Ok).with_field("files", names.join(",")),
        Err(e) => {
            tracing::warn!(workspace, "file listing failed: {e}");
            reply(request, Status::GenericFailure)
        }
    }
}

fn remove_file(state: &ServerState, identity: &str, request: &Message) -> Message {
    let (Some(workspace), Some(target)) =
        (request.field("workspace"), request.field("target"))
    else {
        return reply(request, Status::BadRequest);
    };
    if let Some(status) = membership_failure(state, workspace, identity) {
        return reply(request, status);
    }

    match state.workspaces.remove_file(workspace, target) {
        Ok(()) => reply(request, Status::Ok),
        Err(StoreError::InvalidName(_)) => reply(request, Status::BadRequest),
        Err(StoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            reply(request, Status::NotFound)
        }
        Err(e) => {
            tracing::warn!(workspace, target, "file removal failed: {e}");
            reply(request, Status::GenericFailure)
        }
    }
}

// --- chunked upload -----------------------------------------------------

async fn handle_upload(
    state: &ServerState,
    identity: &str,
    request: &Message,
    kind: PayloadKind,
) -> Message {
    match &request.body {
        Body::Binary(payload) => upload_chunk(state, identity, request, payload).await,
        Body::Structured(_) => {
            let Some(action) = request.field("action") else {
                return reply(request, Status::BadRequest);
            };
            match (action, kind) {
                ("verify", _) => verify_access(state, identity, request),
                ("init", _) => upload_init(state, identity, request, kind).await,
                ("signature_init", PayloadKind::File) => {
                    upload_init(state, identity, request, PayloadKind::Signature).await
                }
                ("complete", _) | ("signature_complete", PayloadKind::File) => {
                    upload_complete(state, identity, request).await
                }
                _ => reply(request, Status::BadRequest),
            }
        }
    }
}

fn verify_access(state: &ServerState, identity: &str, request: &Message) -> Message {
    let Some(workspace) = request.field("workspace") else {
        return reply(request, Status::BadRequest);
    };
    match membership_failure(state, workspace, identity) {
        Some(status) => reply(request, status),
        None => reply(request, Status::Ok),
    }
}

/// Validate the target name for the payload kind being uploaded.
fn acceptable_upload_target(
    state: &ServerState,
    workspace: &str,
    identity: &str,
    target: &str,
    kind: PayloadKind,
) -> Result<(), Status> {
    if !valid_target_name(target) {
        return Err(Status::BadRequest);
    }
    match kind {
        PayloadKind::File => Ok(()),
        // a signature must be by the uploader, by naming convention
        PayloadKind::Signature => match signer_of(target) {
            Some(signer) if signer == identity => Ok(()),
            _ => Err(Status::BadRequest),
        },
        // key records are named <workspace>.key.<member>, and the
        // member must be a known user; only the workspace owner may
        // store records for anyone but themselves
        PayloadKind::Key => {
            let prefix = key_record_name(workspace, "");
            let member = target.strip_prefix(&prefix).unwrap_or_default();
            if member.is_empty() {
                Err(Status::BadRequest)
            } else if !state.users.exists(member) {
                Err(Status::NoUser)
            } else if member != identity && !state.workspaces.is_owner(workspace, identity) {
                Err(Status::NoPermission)
            } else {
                Ok(())
            }
        }
    }
}

async fn upload_init(
    state: &ServerState,
    identity: &str,
    request: &Message,
    kind: PayloadKind,
) -> Message {
    let (Some(workspace), Some(target), Some(size), Some(chunks)) = (
        request.field("workspace"),
        request.field("target"),
        request.field("size"),
        request.field("chunks"),
    ) else {
        return reply(request, Status::BadRequest);
    };
    let (Ok(size), Ok(chunks)) = (size.parse::<u64>(), chunks.parse::<u32>()) else {
        return reply(request, Status::BadRequest);
    };

    if let Some(status) = membership_failure(state, workspace, identity) {
        return reply(request, status);
    }
    if let Err(status) = acceptable_upload_target(state, workspace, identity, target, kind) {
        return reply(request, status);
    }

    let id = match state
        .registry
        .open_upload(kind, workspace, identity, target, size, chunks)
    {
        Ok(id) => id,
        Err(e) => return reply(request, transfer_status(&e)),
    };

    // stage an empty file so even zero-chunk uploads have something
    // to persist at completion
    if let Err(e) = tokio::fs::write(state.registry.staging_path(&id), b"").await {
        tracing::warn!(transfer = %id, "could not create staging file: {e}");
        state.registry.abort(&id);
        return reply(request, Status::GenericFailure);
    }

    tracing::debug!(transfer = %id, workspace, target, size, "upload opened");
    reply(request, Status::Ok).with_field("transfer", id)
}

async fn upload_chunk(
    state: &ServerState,
    identity: &str,
    request: &Message,
    payload: &[u8],
) -> Message {
    let transfer = request
        .header(HDR_FILE_ID)
        .unwrap_or(&request.correlation_id);
    let transfer = transfer.to_string();
    let (Some(chunk), Some(frame_type)) = (request.header(HDR_CHUNK_ID), request.header(HDR_TYPE))
    else {
        return reply(request, Status::BadRequest);
    };
    if frame_type != TYPE_CHUNK && frame_type != TYPE_SIGNATURE {
        return reply(request, Status::BadRequest);
    }
    let Ok(chunk) = chunk.parse::<u32>() else {
        return reply(request, Status::BadRequest);
    };

    if let Some(status) = recheck_membership(state, identity, &transfer) {
        return reply(request, status);
    }

    let step = match state.registry.begin_chunk(&transfer, identity, chunk) {
        Ok(step) => step,
        Err(e) => {
            tracing::debug!(%transfer, "upload chunk rejected: {e}");
            return reply(request, transfer_status(&e));
        }
    };

    // the chunk must carry exactly the declared slice of the file
    if payload.len() as u64 != step.len {
        tracing::debug!(
            %transfer,
            declared = step.len,
            got = payload.len(),
            "chunk length mismatch"
        );
        state.registry.abort(&transfer);
        return reply(request, Status::BadRequest);
    }

    // strict ordering makes append equivalent to writing at the
    // session's byte offset
    let written = async {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&step.path)
            .await?;
        file.write_all(payload).await?;
        file.flush().await
    }
    .await;

    if let Err(e) = written {
        tracing::warn!(%transfer, "chunk write failed: {e}");
        state.registry.abort(&transfer);
        return reply(request, Status::GenericFailure);
    }
    if let Err(e) = state.registry.commit_chunk(&transfer, payload.len() as u64) {
        return reply(request, transfer_status(&e));
    }

    reply(request, Status::Ok)
        .with_header(HDR_FILE_ID, transfer)
        .with_header(HDR_CHUNK_ID, chunk.to_string())
}

async fn upload_complete(state: &ServerState, identity: &str, request: &Message) -> Message {
    let Some(transfer) = request.field("transfer") else {
        return reply(request, Status::BadRequest);
    };

    if let Some(status) = recheck_membership(state, identity, transfer) {
        return reply(request, status);
    }

    let session = match state.registry.complete(transfer, identity) {
        Ok(session) => session,
        Err(e) => {
            tracing::debug!(transfer, "upload completion rejected: {e}");
            return reply(request, transfer_status(&e));
        }
    };

    let destination = match session.kind {
        PayloadKind::Key => state.workspaces.key_path(&session.target_name),
        PayloadKind::File | PayloadKind::Signature => state
            .workspaces
            .file_path(&session.workspace, &session.target_name),
    };
    let Some(destination) = destination else {
        // the workspace vanished mid-transfer
        let _ = tokio::fs::remove_file(&session.backing).await;
        return reply(request, Status::NoWorkspace);
    };

    if let Err(e) = tokio::fs::rename(&session.backing, &destination).await {
        tracing::warn!(transfer, "could not persist upload: {e}");
        let _ = tokio::fs::remove_file(&session.backing).await;
        return reply(request, Status::GenericFailure);
    }

    tracing::info!(
        transfer,
        workspace = %session.workspace,
        target = %session.target_name,
        bytes = session.bytes_moved,
        "upload complete"
    );
    reply(request, Status::Ok)
}

// --- chunked download ---------------------------------------------------

async fn handle_download(
    state: &ServerState,
    identity: &str,
    request: &Message,
    kind: PayloadKind,
) -> Message {
    let Some(action) = request.field("action") else {
        return reply(request, Status::BadRequest);
    };

    match (action, kind) {
        ("verify", _) => verify_access(state, identity, request),
        ("init", _) => download_init(state, identity, request, kind).await,
        ("init_signature", PayloadKind::File) => {
            download_init_signature(state, identity, request).await
        }
        ("chunk", _) | ("signature_chunk", PayloadKind::File) => {
            download_chunk(state, identity, request).await
        }
        ("complete", _) | ("signature_complete", PayloadKind::File) => {
            download_complete(state, identity, request)
        }
        _ => reply(request, Status::BadRequest),
    }
}

async fn download_init(
    state: &ServerState,
    identity: &str,
    request: &Message,
    kind: PayloadKind,
) -> Message {
    let (Some(workspace), Some(target)) =
        (request.field("workspace"), request.field("target"))
    else {
        return reply(request, Status::BadRequest);
    };
    if let Some(status) = membership_failure(state, workspace, identity) {
        return reply(request, status);
    }

    let path = match kind {
        PayloadKind::Key => {
            // members may only fetch their own wrapped record
            if target != key_record_name(workspace, identity) {
                return reply(request, Status::NoPermission);
            }
            state.workspaces.key_path(target)
        }
        _ => state.workspaces.file_path(workspace, target),
    };
    let Some(path) = path else {
        return reply(request, Status::BadRequest);
    };

    open_download(state, identity, request, kind, workspace, target, path).await
}

async fn download_init_signature(
    state: &ServerState,
    identity: &str,
    request: &Message,
) -> Message {
    let (Some(workspace), Some(target)) =
        (request.field("workspace"), request.field("target"))
    else {
        return reply(request, Status::BadRequest);
    };
    if let Some(status) = membership_failure(state, workspace, identity) {
        return reply(request, status);
    }

    let Some(signature) = state.workspaces.find_signature(workspace, target) else {
        return reply(request, Status::NotFound);
    };
    let Some(path) = state.workspaces.file_path(workspace, &signature) else {
        return reply(request, Status::NotFound);
    };

    let workspace = workspace.to_string();
    open_download(
        state,
        identity,
        request,
        PayloadKind::Signature,
        &workspace,
        &signature.clone(),
        path,
    )
    .await
    .with_field("signature", signature)
}

async fn open_download(
    state: &ServerState,
    identity: &str,
    request: &Message,
    kind: PayloadKind,
    workspace: &str,
    target: &str,
    path: std::path::PathBuf,
) -> Message {
    // size and chunk count are authoritative, computed from the
    // stored file rather than anything the client declared
    let size = match tokio::fs::metadata(&path).await {
        Ok(metadata) if metadata.is_file() => metadata.len(),
        Ok(_) => return reply(request, Status::NotFound),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return reply(request, Status::NotFound);
        }
        Err(e) => {
            tracing::warn!(workspace, target, "download init failed: {e}");
            return reply(request, Status::GenericFailure);
        }
    };

    let (id, chunks) = state
        .registry
        .open_download(kind, workspace, identity, target, path, size);

    tracing::debug!(transfer = %id, workspace, target, size, "download opened");
    reply(request, Status::Ok)
        .with_field("transfer", id)
        .with_field("size", size.to_string())
        .with_field("chunks", chunks.to_string())
}

async fn download_chunk(state: &ServerState, identity: &str, request: &Message) -> Message {
    let (Some(transfer), Some(chunk)) = (request.field("transfer"), request.field("chunk"))
    else {
        return reply(request, Status::BadRequest);
    };
    let Ok(chunk) = chunk.parse::<u32>() else {
        return reply(request, Status::BadRequest);
    };
    let transfer = transfer.to_string();

    if let Some(status) = recheck_membership(state, identity, &transfer) {
        return reply(request, status);
    }

    let step = match state.registry.begin_chunk(&transfer, identity, chunk) {
        Ok(step) => step,
        Err(e) => {
            tracing::debug!(%transfer, "download chunk rejected: {e}");
            return reply(request, transfer_status(&e));
        }
    };

    let read = async {
        let mut file = tokio::fs::File::open(&step.path).await?;
        file.seek(SeekFrom::Start(step.offset)).await?;
        let mut buffer = vec![0u8; step.len as usize];
        file.read_exact(&mut buffer).await?;
        Ok::<_, std::io::Error>(buffer)
    }
    .await;

    let buffer = match read {
        Ok(buffer) => buffer,
        Err(e) => {
            tracing::warn!(%transfer, "chunk read failed: {e}");
            state.registry.abort(&transfer);
            return reply(request, Status::GenericFailure);
        }
    };

    if let Err(e) = state.registry.commit_chunk(&transfer, buffer.len() as u64) {
        return reply(request, transfer_status(&e));
    }

    Message::response(Status::Ok, transfer.clone())
        .with_header(HDR_FILE_ID, transfer)
        .with_header(HDR_CHUNK_ID, chunk.to_string())
        .with_binary(buffer)
}

fn download_complete(state: &ServerState, identity: &str, request: &Message) -> Message {
    let Some(transfer) = request.field("transfer") else {
        return reply(request, Status::BadRequest);
    };

    if let Some(status) = recheck_membership(state, identity, transfer) {
        return reply(request, status);
    }

    match state.registry.complete(transfer, identity) {
        Ok(session) => {
            tracing::debug!(
                transfer,
                workspace = %session.workspace,
                bytes = session.bytes_moved,
                "download complete"
            );
            reply(request, Status::Ok)
        }
        Err(e) => {
            tracing::debug!(transfer, "download completion rejected: {e}");
            reply(request, transfer_status(&e))
        }
    }
}

/// Membership may be revoked mid-transfer; every chunk and completion
/// step re-validates it. Losing membership kills the session.
fn recheck_membership(state: &ServerState, identity: &str, transfer: &str) -> Option<Status> {
    let (workspace, owner) = state.registry.route_of(transfer)?;
    if owner == identity && !state.workspaces.is_member(&workspace, identity) {
        state.registry.abort(transfer);
        return Some(Status::NoPermission);
    }
    None
}
